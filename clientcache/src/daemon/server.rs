//! Cache server lifecycle.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::Repository;
use crate::database::Store;
use crate::refresh::{RefreshOptions, RefreshService};
use crate::tokens::KeyringReader;
use crate::{Error, Result};

use super::api;
use super::config::DaemonConfig;
use super::options::Options;
use super::ticker::{TickerConfig, run_ticker};

/// Cache server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonState {
    Initialized,
    /// Both loops and the query surface are active.
    Running,
    ShuttingDown,
    Stopped,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: DaemonState) -> bool {
        use DaemonState::*;

        matches!(
            (self, target),
            (Initialized, Running)
                | (Initialized, Stopped)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: DaemonState) -> Result<DaemonState> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that exists only while serving.
pub(crate) struct ServeContext {
    pub repo: Arc<Repository>,
    pub service: RefreshService,
    pub retrieval: RefreshOptions,
    /// Wakes the data loop early.
    pub trigger: Arc<Notify>,
    pub started_at: DateTime<Utc>,
    pub refresh_interval: TimeDelta,
    pub recheck_support_interval: TimeDelta,
    pub randomization_factor: f64,
}

/// State shared between the server handle and the query surface.
pub(crate) struct Shared {
    pub state: RwLock<DaemonState>,
    pub cancel: CancellationToken,
}

impl Shared {
    pub fn state(&self) -> DaemonState {
        *self.state.read()
    }

    fn transition(&self, target: DaemonState) -> Result<DaemonState> {
        let mut state = self.state.write();
        let from = *state;
        *state = from.transition_to(target)?;
        debug!(from = %from, to = %target, "Cache server state changed");
        Ok(from)
    }

    /// Manual refreshes are only accepted while running.
    pub fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state != DaemonState::Running || self.cancel.is_cancelled() {
            return Err(Error::InvalidStateTransition {
                from: state.as_str().to_string(),
                to: "refreshing".to_string(),
            });
        }
        Ok(())
    }
}

/// The client cache daemon.
pub struct CacheServer {
    config: DaemonConfig,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    context: RwLock<Option<Arc<ServeContext>>>,
}

impl CacheServer {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(DaemonState::Initialized),
                cancel: CancellationToken::new(),
            }),
            tracker: TaskTracker::new(),
            context: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn state(&self) -> DaemonState {
        self.shared.state()
    }

    /// Lifecycle cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Repository of the running server.
    pub fn repository(&self) -> Option<Arc<Repository>> {
        self.context.read().as_ref().map(|ctx| ctx.repo.clone())
    }

    /// Open the store, start both refresh loops and the query socket.
    ///
    /// Returns once everything is running; call [`CacheServer::shutdown`] to stop.
    pub async fn serve(&self, keyring: Arc<dyn KeyringReader>, options: Options) -> Result<()> {
        self.shared.transition(DaemonState::Running)?;

        match self.start(keyring, options).await {
            Ok(()) => {
                info!(dot_dir = %self.config.dot_dir.display(), "Cache server running");
                Ok(())
            }
            Err(e) => {
                // Nothing was spawned; allow another attempt.
                error!(error = %e, "Cache server failed to start");
                *self.shared.state.write() = DaemonState::Initialized;
                Err(e)
            }
        }
    }

    async fn start(&self, keyring: Arc<dyn KeyringReader>, mut options: Options) -> Result<()> {
        let token_reader = options
            .take_token_reader()
            .ok_or_else(|| Error::validation("a token reader function is required"))?;

        let refresh_interval = options
            .refresh_interval()
            .unwrap_or(self.config.refresh_interval);
        let recheck_support_interval = options
            .recheck_support_interval()
            .unwrap_or(self.config.recheck_support_interval);
        let randomization_factor = options
            .interval_randomization_factor()
            .unwrap_or(self.config.randomization_factor);

        let store = Store::open(&self.config.dot_dir, options.debug() || self.config.store_debug)
            .await?;
        let repo = Arc::new(Repository::new(store, keyring, token_reader));

        let ctx = Arc::new(ServeContext {
            service: RefreshService::new(repo.clone()),
            repo,
            retrieval: options.retrieval().clone(),
            trigger: Arc::new(Notify::new()),
            started_at: Utc::now(),
            refresh_interval,
            recheck_support_interval,
            randomization_factor,
        });

        let listener = bind_socket(&self.config).await?;

        self.spawn_data_loop(ctx.clone());
        self.spawn_recheck_loop(ctx.clone());
        self.spawn_api(ctx.clone(), listener);

        *self.context.write() = Some(ctx);
        Ok(())
    }

    fn spawn_data_loop(&self, ctx: Arc<ServeContext>) {
        let cancel = self.shared.cancel.clone();
        let config = TickerConfig {
            name: "refresh",
            interval: ctx.refresh_interval,
            randomization_factor: ctx.randomization_factor,
            immediate: true,
        };
        let wake = Some(ctx.trigger.clone());

        self.tracker.spawn(run_ticker(config, cancel.clone(), wake, move || {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            async move {
                match ctx.service.refresh(&ctx.retrieval, &cancel).await {
                    Ok(()) | Err(Error::Cancelled) => {}
                    Err(e) => warn!(error = %e, "Refresh pass failed"),
                }
            }
        }));
    }

    fn spawn_recheck_loop(&self, ctx: Arc<ServeContext>) {
        let cancel = self.shared.cancel.clone();
        let config = TickerConfig {
            name: "recheck_support",
            interval: ctx.recheck_support_interval,
            randomization_factor: ctx.randomization_factor,
            immediate: false,
        };

        self.tracker.spawn(run_ticker(config, cancel.clone(), None, move || {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            async move {
                match ctx.service.recheck_support(&ctx.retrieval, &cancel).await {
                    Ok(()) | Err(Error::Cancelled) => {}
                    Err(e) => debug!(error = %e, "Support recheck pass failed"),
                }
            }
        }));
    }

    fn spawn_api(&self, ctx: Arc<ServeContext>, listener: UnixListener) {
        let cancel = self.shared.cancel.clone();
        let router = api::router(ctx, self.shared.clone());

        self.tracker.spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Query surface stopped with error");
            }
        });
    }

    /// Wake the data loop now.
    pub fn trigger_refresh(&self) -> Result<()> {
        self.shared.ensure_running()?;
        if let Some(ctx) = self.context.read().as_ref() {
            ctx.trigger.notify_one();
        }
        Ok(())
    }

    /// Run a data pass immediately and return its outcome.
    ///
    /// The pass is tracked, so `shutdown` waits for it before closing the store.
    pub async fn refresh_now(&self) -> Result<()> {
        self.shared.ensure_running()?;
        let ctx = self
            .context
            .read()
            .clone()
            .ok_or_else(|| Error::Other("cache server has no serve context".to_string()))?;
        self.tracker
            .track_future(ctx.service.refresh(&ctx.retrieval, &self.shared.cancel))
            .await
    }

    /// Stop the loops and the query surface, waiting up to the grace period.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state() == DaemonState::Initialized {
            self.shared.transition(DaemonState::Stopped)?;
            self.shared.cancel.cancel();
            return Ok(());
        }

        self.shared.transition(DaemonState::ShuttingDown)?;
        info!(grace = ?self.config.shutdown_grace, "Shutting down cache server");

        self.shared.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed; abandoning in-flight work");
        }

        let ctx = self.context.write().take();
        if let Some(ctx) = ctx {
            ctx.repo.store().close().await;
        }

        let socket = self.config.socket_path();
        if let Err(e) = tokio::fs::remove_file(&socket).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %socket.display(), error = %e, "Failed to remove socket");
        }

        self.shared.transition(DaemonState::Stopped)?;
        info!("Cache server stopped");
        Ok(())
    }
}

async fn bind_socket(config: &DaemonConfig) -> Result<UnixListener> {
    let path = config.socket_path();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "Listening on socket");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use DaemonState::*;

        assert!(Initialized.can_transition_to(Running));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));
        assert!(Initialized.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!ShuttingDown.can_transition_to(Running));

        let err = Stopped.transition_to(Running).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }
}
