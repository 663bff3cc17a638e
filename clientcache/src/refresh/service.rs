//! Refresh pass orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Principal, Repository};
use crate::domain::{AuthToken, CacheableResource, RefreshTokenValue, SupportState};
use crate::{Error, Result};

use super::failures::{FailureKind, RefreshFailure, RefreshFailures};
use super::retrieval::{RefreshOptions, RetrievalFn, Retrieved};

/// Principals refreshed concurrently within one pass.
pub const MAX_CONCURRENT_PRINCIPALS: usize = 8;

/// Which scopes a pass visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Scopes that are `Unknown` or `Supported`.
    Data,
    /// Scopes that are `Unsupported`, to detect controller upgrades.
    Recheck,
}

impl PassKind {
    fn visits(self, state: SupportState) -> bool {
        match self {
            Self::Data => state != SupportState::Unsupported,
            Self::Recheck => state == SupportState::Unsupported,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Recheck => "recheck",
        }
    }
}

/// Raw token of the principal being refreshed, resolved on first use.
enum TokenSlot {
    Unresolved,
    Resolved(String),
    Failed,
}

/// Fetches, diffs and commits cached resources for every principal.
pub struct RefreshService {
    repo: Arc<Repository>,
}

impl RefreshService {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Run a data pass over `Unknown` and `Supported` scopes.
    #[instrument(skip_all)]
    pub async fn refresh(&self, opts: &RefreshOptions, cancel: &CancellationToken) -> Result<()> {
        self.run_pass(PassKind::Data, opts, cancel).await
    }

    /// Run a recheck pass over `Unsupported` scopes.
    #[instrument(skip_all)]
    pub async fn recheck_support(
        &self,
        opts: &RefreshOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_pass(PassKind::Recheck, opts, cancel).await
    }

    async fn run_pass(
        &self,
        kind: PassKind,
        opts: &RefreshOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Err(e) = self.repo.clean_expired_or_orphaned_auth_tokens().await {
            warn!(error = %e, "Failed to clean auth tokens before refresh");
        }

        let principals = self.repo.list_principals().await?;
        if principals.is_empty() || opts.is_empty() {
            debug!(pass = kind.as_str(), "Nothing to refresh");
            return Ok(());
        }

        let count = principals.len();
        let results: Vec<Result<Vec<RefreshFailure>>> = futures::stream::iter(principals)
            .map(|principal| async move {
                self.refresh_principal(kind, &principal, opts, cancel).await
            })
            .buffer_unordered(MAX_CONCURRENT_PRINCIPALS)
            .collect()
            .await;

        let mut failures = RefreshFailures::default();
        for result in results {
            failures.extend(result?);
        }

        if failures.is_empty() {
            debug!(pass = kind.as_str(), principals = count, "Refresh pass completed");
        } else {
            info!(
                pass = kind.as_str(),
                principals = count,
                failures = failures.len(),
                "Refresh pass completed with failures"
            );
        }
        failures.into_result()
    }

    /// Refresh every tracked type for one principal.
    ///
    /// Only cancellation is returned as an error; everything else is recorded.
    async fn refresh_principal(
        &self,
        kind: PassKind,
        principal: &Principal,
        opts: &RefreshOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<RefreshFailure>> {
        let mut failures = Vec::new();
        let mut token = TokenSlot::Unresolved;

        if let Some(f) = opts.target_fn() {
            self.refresh_scope(kind, principal, &mut token, f, cancel, &mut failures)
                .await?;
        }
        if let Some(f) = opts.session_fn() {
            self.refresh_scope(kind, principal, &mut token, f, cancel, &mut failures)
                .await?;
        }

        Ok(failures)
    }

    #[instrument(
        skip(self, principal, token, f, cancel, failures),
        fields(
            pass = kind.as_str(),
            address = %principal.address,
            auth_token_id = %principal.auth_token_id,
            resource_type = %T::RESOURCE_TYPE
        )
    )]
    async fn refresh_scope<T: CacheableResource>(
        &self,
        kind: PassKind,
        principal: &Principal,
        token: &mut TokenSlot,
        f: &RetrievalFn<T>,
        cancel: &CancellationToken,
        failures: &mut Vec<RefreshFailure>,
    ) -> Result<()> {
        let resource_type = T::RESOURCE_TYPE;
        let scope = principal.scope(resource_type);
        let record = |kind: FailureKind, e: &Error| {
            RefreshFailure::new(principal, Some(resource_type), kind, e)
        };

        let _guard = tokio::select! {
            guard = self.repo.lock_scope(&scope) => guard,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let state = match self.repo.get_support_state(&scope).await {
            Ok(state) => state,
            Err(e) => {
                failures.push(record(FailureKind::Store, &e));
                return Ok(());
            }
        };
        if !kind.visits(state) {
            return Ok(());
        }

        let raw_token = match token {
            TokenSlot::Resolved(raw) => raw.clone(),
            TokenSlot::Failed => return Ok(()),
            TokenSlot::Unresolved => match resolve(&self.repo, principal, cancel).await? {
                Ok(auth_token) => {
                    *token = TokenSlot::Resolved(auth_token.token.clone());
                    auth_token.token
                }
                Err(e) => {
                    warn!(error = %e, "Failed to resolve token; skipping principal");
                    *token = TokenSlot::Failed;
                    failures.push(RefreshFailure::new(
                        principal,
                        None,
                        FailureKind::TokenResolution,
                        &e,
                    ));
                    return Ok(());
                }
            },
        };

        let mut cursor = match self.repo.get_refresh_cursor(&scope).await {
            Ok(cursor) => cursor,
            Err(e) => {
                failures.push(record(FailureKind::Store, &e));
                return Ok(());
            }
        };

        let mut outcome = fetch(f, principal, &raw_token, &cursor, cancel).await?;

        if let Err(Error::InvalidRefreshToken(reason)) = &outcome {
            if !cursor.is_empty() {
                warn!(%reason, "Controller rejected refresh cursor; falling back to a full fetch");
                cursor = RefreshTokenValue::default();
                if let Err(e) = self.repo.set_refresh_cursor(&scope, &cursor).await {
                    failures.push(record(FailureKind::Store, &e));
                    return Ok(());
                }
                outcome = fetch(f, principal, &raw_token, &cursor, cancel).await?;
            }
        }

        let retrieved = match outcome {
            Ok(retrieved) => retrieved,
            Err(e) if e.is_not_supported() => {
                info!("Controller does not support refresh tokens; clearing cached resources");
                match self.repo.mark_unsupported(&scope).await {
                    Ok(()) => failures.push(record(FailureKind::NotSupported, &e)),
                    Err(store_err) => failures.push(record(FailureKind::Store, &store_err)),
                }
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Retrieval failed; keeping cached resources");
                failures.push(record(FailureKind::Retrieval, &e));
                return Ok(());
            }
        };

        if retrieved.is_empty() {
            debug!("Retrieval returned nothing; cache left untouched");
            return Ok(());
        }

        let Retrieved {
            upserted,
            mut removed_ids,
            cursor: new_cursor,
        } = retrieved;

        // A request without a cursor returns the full listing.
        if cursor.is_empty() {
            match self.repo.list_cached_ids(&scope).await {
                Ok(cached) => {
                    let present: HashSet<&str> = upserted.iter().map(|r| r.id()).collect();
                    removed_ids.extend(
                        cached
                            .into_iter()
                            .filter(|id| !present.contains(id.as_str())),
                    );
                }
                Err(e) => {
                    failures.push(record(FailureKind::Store, &e));
                    return Ok(());
                }
            }
        }

        match self
            .repo
            .replace_resource_set(&scope, &upserted, &removed_ids, &new_cursor)
            .await
        {
            Ok(()) => {
                debug!(
                    upserted = upserted.len(),
                    removed = removed_ids.len(),
                    "Committed refreshed resources"
                );
                if kind == PassKind::Recheck {
                    info!("Controller now supports refresh tokens");
                }
            }
            Err(e) => failures.push(record(FailureKind::Store, &e)),
        }

        Ok(())
    }
}

/// Resolve the principal's raw token, abandoning the reader if the lifecycle is cancelled.
async fn resolve(
    repo: &Repository,
    principal: &Principal,
    cancel: &CancellationToken,
) -> Result<Result<AuthToken>> {
    tokio::select! {
        result = repo.resolve_principal(principal) => Ok(result),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Call the retrieval function, abandoning it if the lifecycle is cancelled.
async fn fetch<T: CacheableResource>(
    f: &RetrievalFn<T>,
    principal: &Principal,
    raw_token: &str,
    cursor: &RefreshTokenValue,
    cancel: &CancellationToken,
) -> Result<Result<Retrieved<T>>> {
    tokio::select! {
        result = f.call(&principal.address, raw_token, cursor.clone()) => Ok(result),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
