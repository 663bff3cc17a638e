//! Injected token reader.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::Result;
use crate::domain::AuthToken;

pub type TokenReaderFuture = BoxFuture<'static, Result<Option<AuthToken>>>;

/// Fetches the current [`AuthToken`] for `(address, raw_token)` from the controller.
///
/// `Ok(None)` means the snapshot is unchanged. An `Unauthenticated` error means
/// the controller rejected the token.
#[derive(Clone)]
pub struct TokenReaderFn(Arc<dyn Fn(String, String) -> TokenReaderFuture + Send + Sync>);

impl TokenReaderFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AuthToken>>> + Send + 'static,
    {
        Self(Arc::new(move |address, token| Box::pin(f(address, token))))
    }

    pub async fn read(&self, address: &str, token: &str) -> Result<Option<AuthToken>> {
        (self.0)(address.to_string(), token.to_string()).await
    }
}

impl fmt::Debug for TokenReaderFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenReaderFn")
    }
}
