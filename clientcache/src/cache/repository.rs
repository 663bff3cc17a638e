//! Repository over the cache store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::TimeDelta;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::database::Store;
use crate::database::models::{
    AuthTokenDbModel, CachedResourceDbModel, KeyringTokenDbModel,
};
use crate::database::repositories::{
    AuthTokenRepository, ResourceRepository, SqlxAuthTokenRepository, SqlxResourceRepository,
};
use crate::database::time::now_ms;
use crate::domain::{
    AuthToken, CacheableResource, KeyringToken, RefreshTokenValue, ResourceType, Scope, Session,
    SupportState, Target, is_valid_auth_token_id,
};
use crate::tokens::{KeyringReader, TokenReaderFn};
use crate::{Error, Result};

/// How long an auth token snapshot is trusted before the token reader is asked again.
pub const DEFAULT_TOKEN_STALENESS: TimeDelta = TimeDelta::seconds(60);

/// Where a principal's raw token comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalSource {
    Keyring {
        keyring_type: String,
        token_name: String,
    },
    /// Token handed to the daemon directly and held in memory only.
    Keyringless,
}

/// An `(address, auth token)` pair the cache refreshes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub address: String,
    pub auth_token_id: String,
    pub source: PrincipalSource,
}

impl Principal {
    pub fn scope(&self, resource_type: ResourceType) -> Scope {
        Scope::new(&self.address, &self.auth_token_id, resource_type)
    }
}

#[derive(Debug, Clone)]
struct KeyringlessToken {
    address: String,
    token: String,
}

/// Persistent state of the client cache.
pub struct Repository {
    store: Store,
    auth_tokens: Arc<dyn AuthTokenRepository>,
    resources: Arc<dyn ResourceRepository>,
    keyring: Arc<dyn KeyringReader>,
    token_reader: TokenReaderFn,
    /// Raw tokens registered without a keyring, keyed by auth token id.
    keyringless: DashMap<String, KeyringlessToken>,
    /// Per-scope locks serializing refresh passes.
    scope_locks: DashMap<Scope, Arc<Mutex<()>>>,
    staleness: TimeDelta,
}

impl Repository {
    pub fn new(store: Store, keyring: Arc<dyn KeyringReader>, token_reader: TokenReaderFn) -> Self {
        let auth_tokens = Arc::new(SqlxAuthTokenRepository::new(
            store.pool().clone(),
            store.write_pool().clone(),
        ));
        let resources = Arc::new(SqlxResourceRepository::new(
            store.pool().clone(),
            store.write_pool().clone(),
        ));

        Self {
            store,
            auth_tokens,
            resources,
            keyring,
            token_reader,
            keyringless: DashMap::new(),
            scope_locks: DashMap::new(),
            staleness: DEFAULT_TOKEN_STALENESS,
        }
    }

    /// Override the snapshot staleness window.
    pub fn with_staleness(mut self, staleness: TimeDelta) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register (or re-register) a keyring token for `address`.
    ///
    /// The raw token is read from the keyring and validated with the token
    /// reader before the snapshot and keyring token are written together.
    #[instrument(skip(self, token), fields(token_name = %token.token_name, auth_token_id = %token.auth_token_id))]
    pub async fn add_keyring_token(&self, address: &str, token: KeyringToken) -> Result<AuthToken> {
        let mut token = token;
        if token.address.is_empty() {
            token.address = address.to_string();
        } else if token.address != address {
            return Err(Error::invalid_argument(format!(
                "keyring token address {} does not match {}",
                token.address, address
            )));
        }
        token.validate()?;

        let raw = self
            .keyring
            .read_token_from_keyring(&token.keyring_type, &token.token_name)
            .await?
            .ok_or_else(|| Error::not_found("keyring entry", &token.token_name))?;

        let auth_token = self
            .read_for_registration(address, &token.auth_token_id, &raw)
            .await?;

        let now = now_ms();
        let snapshot = AuthTokenDbModel::from_domain(address, &auth_token, now);
        let keyring_token = KeyringTokenDbModel {
            address: token.address.clone(),
            keyring_type: token.keyring_type.clone(),
            token_name: token.token_name.clone(),
            auth_token_id: token.auth_token_id.clone(),
            created_at: now,
        };
        self.auth_tokens
            .save_keyring_registration(&snapshot, &keyring_token)
            .await?;

        info!("Registered keyring token");
        Ok(auth_token)
    }

    /// Register a raw token that is not stored in any keyring.
    #[instrument(skip(self, raw_token))]
    pub async fn add_raw_token(
        &self,
        address: &str,
        raw_token: &str,
        auth_token_id: &str,
    ) -> Result<AuthToken> {
        if address.is_empty() {
            return Err(Error::invalid_argument("address is empty"));
        }
        if raw_token.is_empty() {
            return Err(Error::invalid_argument("token is empty"));
        }
        if !is_valid_auth_token_id(auth_token_id) {
            return Err(Error::invalid_argument(format!(
                "malformed auth token id: {auth_token_id}"
            )));
        }

        let auth_token = self
            .read_for_registration(address, auth_token_id, raw_token)
            .await?;
        let snapshot = AuthTokenDbModel::from_domain(address, &auth_token, now_ms());
        self.auth_tokens.save_snapshot(&snapshot).await?;

        self.keyringless.insert(
            auth_token_id.to_string(),
            KeyringlessToken {
                address: address.to_string(),
                token: raw_token.to_string(),
            },
        );

        info!("Registered keyringless token");
        Ok(auth_token)
    }

    /// Validate a raw token for registration under `auth_token_id`.
    async fn read_for_registration(
        &self,
        address: &str,
        auth_token_id: &str,
        raw: &str,
    ) -> Result<AuthToken> {
        match self.token_reader.read(address, raw).await? {
            Some(auth_token) => {
                if auth_token.id != auth_token_id {
                    return Err(Error::invalid_argument(format!(
                        "token belongs to auth token {} not {}",
                        auth_token.id, auth_token_id
                    )));
                }
                if auth_token.is_expired() {
                    return Err(Error::unauthenticated(format!(
                        "auth token {auth_token_id} has expired"
                    )));
                }
                Ok(AuthToken {
                    token: raw.to_string(),
                    ..auth_token
                })
            }
            None => {
                let existing = self
                    .auth_tokens
                    .get(auth_token_id)
                    .await?
                    .ok_or_else(|| Error::not_found("auth token", auth_token_id))?;
                Ok(existing.into_domain(raw.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Token resolution
    // ------------------------------------------------------------------

    /// Resolve the current auth token, including its raw token, for a keyring entry.
    ///
    /// Fails with `NotFound` when the keyring entry is gone (the stale keyring
    /// token is removed) and `Unauthenticated` when the token was rejected or
    /// has expired (the keyring token and its snapshot are removed).
    #[instrument(skip(self))]
    pub async fn lookup_auth_token(&self, address: &str, token_name: &str) -> Result<AuthToken> {
        let keyring_token = self
            .auth_tokens
            .find_keyring_token(address, token_name)
            .await?
            .ok_or_else(|| Error::not_found("keyring token", token_name))?;

        self.lookup_keyring_token(&keyring_token).await
    }

    /// Resolve the current auth token for a principal.
    pub async fn resolve_principal(&self, principal: &Principal) -> Result<AuthToken> {
        match &principal.source {
            PrincipalSource::Keyring {
                keyring_type,
                token_name,
            } => {
                let keyring_token = KeyringTokenDbModel {
                    address: principal.address.clone(),
                    keyring_type: keyring_type.clone(),
                    token_name: token_name.clone(),
                    auth_token_id: principal.auth_token_id.clone(),
                    created_at: 0,
                };
                self.lookup_keyring_token(&keyring_token).await
            }
            PrincipalSource::Keyringless => self.lookup_keyringless(&principal.auth_token_id).await,
        }
    }

    async fn lookup_keyring_token(&self, keyring_token: &KeyringTokenDbModel) -> Result<AuthToken> {
        let raw = self
            .keyring
            .read_token_from_keyring(&keyring_token.keyring_type, &keyring_token.token_name)
            .await?;

        let Some(raw) = raw else {
            debug!(
                token_name = %keyring_token.token_name,
                "Keyring entry is gone; removing keyring token"
            );
            self.auth_tokens
                .delete_keyring_token(
                    &keyring_token.address,
                    &keyring_token.keyring_type,
                    &keyring_token.token_name,
                )
                .await?;
            return Err(Error::not_found("keyring entry", &keyring_token.token_name));
        };

        match self
            .refresh_snapshot(&keyring_token.address, &keyring_token.auth_token_id, &raw)
            .await
        {
            Err(e) if e.is_unauthenticated() => {
                warn!(
                    auth_token_id = %keyring_token.auth_token_id,
                    error = %e,
                    "Auth token no longer valid; removing keyring token"
                );
                self.auth_tokens
                    .delete_keyring_registration(keyring_token)
                    .await?;
                Err(e)
            }
            other => other,
        }
    }

    async fn lookup_keyringless(&self, auth_token_id: &str) -> Result<AuthToken> {
        let entry = self
            .keyringless
            .get(auth_token_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("keyringless token", auth_token_id))?;

        match self
            .refresh_snapshot(&entry.address, auth_token_id, &entry.token)
            .await
        {
            Err(e) if e.is_unauthenticated() => {
                warn!(auth_token_id, error = %e, "Keyringless token no longer valid; removing");
                self.keyringless.remove(auth_token_id);
                self.auth_tokens.delete(auth_token_id).await?;
                Err(e)
            }
            other => other,
        }
    }

    /// Return the snapshot for `auth_token_id`, asking the token reader when it
    /// is absent or older than the staleness window.
    async fn refresh_snapshot(
        &self,
        address: &str,
        auth_token_id: &str,
        raw: &str,
    ) -> Result<AuthToken> {
        let now = now_ms();
        let snapshot = self.auth_tokens.get(auth_token_id).await?;

        if let Some(snapshot) = &snapshot {
            if snapshot.is_expired_at(now) {
                return Err(Error::unauthenticated(format!(
                    "auth token {auth_token_id} has expired"
                )));
            }
            if !snapshot.is_stale_at(now, self.staleness.num_milliseconds()) {
                return Ok(snapshot.clone().into_domain(raw.to_string()));
            }
        }

        let refreshed = match self.token_reader.read(address, raw).await? {
            Some(auth_token) => {
                if auth_token.id != auth_token_id {
                    return Err(Error::unauthenticated(format!(
                        "token now belongs to auth token {}",
                        auth_token.id
                    )));
                }
                AuthTokenDbModel::from_domain(address, &auth_token, now)
            }
            None => match snapshot {
                Some(mut unchanged) => {
                    unchanged.last_refreshed_at = now;
                    unchanged
                }
                None => return Err(Error::not_found("auth token", auth_token_id)),
            },
        };

        if refreshed.is_expired_at(now) {
            return Err(Error::unauthenticated(format!(
                "auth token {auth_token_id} has expired"
            )));
        }

        self.auth_tokens.save_snapshot(&refreshed).await?;
        Ok(refreshed.into_domain(raw.to_string()))
    }

    // ------------------------------------------------------------------
    // Auth tokens
    // ------------------------------------------------------------------

    /// Snapshots issued by `address`. Raw tokens are not included.
    pub async fn list_auth_tokens(&self, address: &str) -> Result<Vec<AuthToken>> {
        Ok(self
            .auth_tokens
            .list_by_address(address)
            .await?
            .into_iter()
            .map(|model| model.into_domain(String::new()))
            .collect())
    }

    /// Read one snapshot by id.
    ///
    /// A malformed id is `InvalidArgument`; a well-formed unknown id is `NotFound`.
    pub async fn read_auth_token(&self, id: &str) -> Result<AuthToken> {
        if !is_valid_auth_token_id(id) {
            return Err(Error::invalid_argument(format!("malformed auth token id: {id}")));
        }
        self.auth_tokens
            .get(id)
            .await?
            .map(|model| model.into_domain(String::new()))
            .ok_or_else(|| Error::not_found("auth token", id))
    }

    /// Delete a snapshot with its keyring tokens and cached state.
    /// Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn delete_auth_token(&self, id: &str) -> Result<bool> {
        if !is_valid_auth_token_id(id) {
            return Err(Error::invalid_argument(format!("malformed auth token id: {id}")));
        }
        let in_memory = self.keyringless.remove(id).is_some();
        let existed = self.auth_tokens.delete(id).await?;
        self.prune_scope_locks(|auth_token_id| auth_token_id == id);
        Ok(existed || in_memory)
    }

    pub async fn list_keyring_tokens(&self) -> Result<Vec<KeyringToken>> {
        Ok(self
            .auth_tokens
            .list_keyring_tokens()
            .await?
            .into_iter()
            .map(KeyringToken::from)
            .collect())
    }

    /// Every principal with a keyring token or a keyringless registration.
    pub async fn list_principals(&self) -> Result<Vec<Principal>> {
        let mut principals: Vec<Principal> = self
            .auth_tokens
            .list_keyring_tokens()
            .await?
            .into_iter()
            .map(|kt| Principal {
                address: kt.address,
                auth_token_id: kt.auth_token_id,
                source: PrincipalSource::Keyring {
                    keyring_type: kt.keyring_type,
                    token_name: kt.token_name,
                },
            })
            .collect();

        let mut keyringless: Vec<Principal> = self
            .keyringless
            .iter()
            .map(|entry| Principal {
                address: entry.value().address.clone(),
                auth_token_id: entry.key().clone(),
                source: PrincipalSource::Keyringless,
            })
            .collect();
        keyringless.sort_by(|a, b| a.auth_token_id.cmp(&b.auth_token_id));
        principals.extend(keyringless);

        Ok(principals)
    }

    /// Delete snapshots that are expired or no longer referenced by any
    /// keyring token or keyringless registration. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn clean_expired_or_orphaned_auth_tokens(&self) -> Result<usize> {
        let keep: HashSet<String> = self.keyringless.iter().map(|e| e.key().clone()).collect();
        let deleted = self
            .auth_tokens
            .delete_expired_or_orphaned(now_ms(), &keep)
            .await?;
        for id in &deleted {
            self.keyringless.remove(id);
        }
        if !deleted.is_empty() {
            let deleted: HashSet<&str> = deleted.iter().map(String::as_str).collect();
            self.prune_scope_locks(|auth_token_id| deleted.contains(auth_token_id));
        }
        if !deleted.is_empty() {
            info!(count = deleted.len(), "Removed expired or orphaned auth tokens");
        }
        Ok(deleted.len())
    }

    // ------------------------------------------------------------------
    // Cached resources
    // ------------------------------------------------------------------

    /// Committed resources for `scope`. Never touches the network.
    pub async fn list_cached_resources<T: CacheableResource>(&self, scope: &Scope) -> Result<Vec<T>> {
        check_resource_type::<T>(scope)?;
        self.resources
            .list(scope)
            .await?
            .iter()
            .map(CachedResourceDbModel::decode::<T>)
            .collect()
    }

    pub async fn list_targets(&self, address: &str, auth_token_id: &str) -> Result<Vec<Target>> {
        self.list_cached_resources(&Scope::new(address, auth_token_id, ResourceType::Target))
            .await
    }

    pub async fn list_sessions(&self, address: &str, auth_token_id: &str) -> Result<Vec<Session>> {
        self.list_cached_resources(&Scope::new(address, auth_token_id, ResourceType::Session))
            .await
    }

    /// Ids of the committed resources for `scope`.
    pub async fn list_cached_ids(&self, scope: &Scope) -> Result<Vec<String>> {
        self.resources.list_ids(scope).await
    }

    /// Current cursor; empty when none is stored.
    pub async fn get_refresh_cursor(&self, scope: &Scope) -> Result<RefreshTokenValue> {
        Ok(self
            .resources
            .get_state(scope)
            .await?
            .map(|state| state.cursor())
            .unwrap_or_default())
    }

    pub async fn set_refresh_cursor(&self, scope: &Scope, cursor: &RefreshTokenValue) -> Result<()> {
        self.resources.set_cursor(scope, cursor).await
    }

    pub async fn get_support_state(&self, scope: &Scope) -> Result<SupportState> {
        Ok(self
            .resources
            .get_state(scope)
            .await?
            .map(|state| state.support_state())
            .unwrap_or_default())
    }

    pub async fn set_support_state(&self, scope: &Scope, state: SupportState) -> Result<()> {
        self.resources.set_support_state(scope, state).await
    }

    /// Atomically remove `removed_ids`, upsert `upserts`, advance the cursor
    /// and mark the scope supported.
    #[instrument(skip(self, upserts, removed_ids, cursor), fields(scope = %scope, upserts = upserts.len(), removed = removed_ids.len()))]
    pub async fn replace_resource_set<T: CacheableResource>(
        &self,
        scope: &Scope,
        upserts: &[T],
        removed_ids: &[String],
        cursor: &RefreshTokenValue,
    ) -> Result<()> {
        check_resource_type::<T>(scope)?;
        let now = now_ms();
        let items = upserts
            .iter()
            .map(|resource| CachedResourceDbModel::encode(scope, resource, now))
            .collect::<Result<Vec<_>>>()?;

        self.resources
            .replace_resource_set(scope, &items, removed_ids, cursor)
            .await
    }

    /// Atomically clear the scope's resources and cursor and mark it unsupported.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn mark_unsupported(&self, scope: &Scope) -> Result<()> {
        self.resources.mark_unsupported(scope).await
    }

    /// Acquire the lock serializing refresh work on `scope`.
    pub async fn lock_scope(&self, scope: &Scope) -> OwnedMutexGuard<()> {
        let lock = self
            .scope_locks
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Number of scopes with a lock entry.
    pub fn scope_lock_count(&self) -> usize {
        self.scope_locks.len()
    }

    /// Drop lock entries of deleted auth tokens. Locks still held are kept.
    fn prune_scope_locks(&self, deleted: impl Fn(&str) -> bool) {
        self.scope_locks
            .retain(|scope, lock| !deleted(&scope.auth_token_id) || Arc::strong_count(lock) > 1);
    }
}

fn check_resource_type<T: CacheableResource>(scope: &Scope) -> Result<()> {
    if scope.resource_type != T::RESOURCE_TYPE {
        return Err(Error::invalid_argument(format!(
            "scope holds {} resources, not {}",
            scope.resource_type,
            T::RESOURCE_TYPE
        )));
    }
    Ok(())
}
