use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use clientcache::daemon::{CacheServer, DaemonConfig, Options};
use clientcache::tokens::{KeyringReader, TokenReaderFn};
use clientcache::{logging, panic_hook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = DaemonConfig::from_env().context("invalid daemon configuration")?;

    let (log_handle, _guard) = logging::init_logging(&config.log_dir())?;
    panic_hook::install(config.log_dir());

    let server = CacheServer::new(config)?;
    log_handle.start_retention_cleanup(server.cancellation_token());

    // Without a controller client, stored snapshots are trusted until they
    // expire; embedders inject a real reader and retrieval functions.
    let options = Options::new()
        .with_token_reader(TokenReaderFn::new(|_address, _token| async { Ok(None) }));

    server.serve(default_keyring(), options).await?;
    info!(socket = %server.config().socket_path().display(), "clientcache started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    if let Err(e) = server.shutdown().await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }
    Ok(())
}

#[cfg(feature = "system-keyring")]
fn default_keyring() -> Arc<dyn KeyringReader> {
    Arc::new(clientcache::tokens::SystemKeyring::new())
}

#[cfg(not(feature = "system-keyring"))]
fn default_keyring() -> Arc<dyn KeyringReader> {
    warn!("Built without system-keyring; only keyringless tokens can be used");
    Arc::new(clientcache::tokens::MemoryKeyring::new())
}
