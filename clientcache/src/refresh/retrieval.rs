//! Retrieval function contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::Result;
use crate::domain::{RefreshTokenValue, Session, Target};

/// Result of one retrieval call.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved<T> {
    /// Resources that are new or changed since the request cursor.
    pub upserted: Vec<T>,
    /// Ids deleted since the request cursor.
    pub removed_ids: Vec<String>,
    /// Cursor to send on the next call.
    pub cursor: RefreshTokenValue,
}

impl<T> Retrieved<T> {
    pub fn new(upserted: Vec<T>, removed_ids: Vec<String>, cursor: RefreshTokenValue) -> Self {
        Self {
            upserted,
            removed_ids,
            cursor,
        }
    }

    /// The no-op result: nothing changed and no cursor was issued.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), RefreshTokenValue::default())
    }

    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed_ids.is_empty() && self.cursor.is_empty()
    }
}

impl<T> Default for Retrieved<T> {
    fn default() -> Self {
        Self::empty()
    }
}

pub type RetrievalFuture<T> = BoxFuture<'static, Result<Retrieved<T>>>;

/// Fetches resources of one type from the controller.
///
/// Called with `(address, raw_token, cursor)`. An empty cursor asks for a full
/// listing. The function returns [`crate::Error::RefreshNotSupported`] when the
/// controller cannot issue cursors, and [`Retrieved::empty`] for a token it
/// does not recognise.
pub struct RetrievalFn<T>(
    Arc<dyn Fn(String, String, RefreshTokenValue) -> RetrievalFuture<T> + Send + Sync>,
);

impl<T: Send + 'static> RetrievalFn<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, String, RefreshTokenValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Retrieved<T>>> + Send + 'static,
    {
        Self(Arc::new(move |address, token, cursor| {
            Box::pin(f(address, token, cursor))
        }))
    }

    pub async fn call(
        &self,
        address: &str,
        token: &str,
        cursor: RefreshTokenValue,
    ) -> Result<Retrieved<T>> {
        (self.0)(address.to_string(), token.to_string(), cursor).await
    }
}

impl<T> Clone for RetrievalFn<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for RetrievalFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetrievalFn")
    }
}

/// Retrieval functions used by a refresh pass. Types without one are skipped.
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub(crate) target_fn: Option<RetrievalFn<Target>>,
    pub(crate) session_fn: Option<RetrievalFn<Session>>,
}

impl RefreshOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_retrieval_fn(mut self, f: RetrievalFn<Target>) -> Self {
        self.target_fn = Some(f);
        self
    }

    pub fn with_session_retrieval_fn(mut self, f: RetrievalFn<Session>) -> Self {
        self.session_fn = Some(f);
        self
    }

    pub fn target_fn(&self) -> Option<&RetrievalFn<Target>> {
        self.target_fn.as_ref()
    }

    pub fn session_fn(&self) -> Option<&RetrievalFn<Session>> {
        self.session_fn.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.target_fn.is_none() && self.session_fn.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_result() {
        let r: Retrieved<Target> = Retrieved::default();
        assert!(r.is_empty());

        let with_cursor: Retrieved<Target> = Retrieved::new(vec![], vec![], "c1".into());
        assert!(!with_cursor.is_empty());
    }

    #[tokio::test]
    async fn test_retrieval_fn_passes_arguments() {
        let f = RetrievalFn::new(|address: String, token: String, cursor: RefreshTokenValue| async move {
            Ok(Retrieved::new(
                vec![Target {
                    id: format!("{address}:{token}"),
                    ..Default::default()
                }],
                vec![],
                RefreshTokenValue::new(format!("{}+1", cursor.as_str())),
            ))
        });

        let r = f.call("addr", "tok", "c0".into()).await.unwrap();
        assert_eq!(r.upserted[0].id, "addr:tok");
        assert_eq!(r.cursor.as_str(), "c0+1");
    }
}
