//! Shared fixtures: a fake controller and store helpers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tempfile::TempDir;

use clientcache::cache::Repository;
use clientcache::database::Store;
use clientcache::domain::{AuthToken, CacheableResource, RefreshTokenValue, Session, Target};
use clientcache::refresh::{RefreshOptions, RetrievalFn, Retrieved};
use clientcache::tokens::{MemoryKeyring, TokenReaderFn};
use clientcache::{Error, Result};

pub const ADDRESS: &str = "https://controller.example:9200";
pub const KEYRING_TYPE: &str = "memory";

/// `at_` followed by ten digits.
pub fn token_id(n: u32) -> String {
    format!("at_{n:010}")
}

/// Current time at the millisecond precision the store keeps.
pub fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

pub fn auth_token(id: &str, ttl: TimeDelta) -> AuthToken {
    let now = now_ms();
    AuthToken {
        id: id.to_string(),
        user_id: "u_1234567890".to_string(),
        auth_method_id: "ampw_1234567890".to_string(),
        token: String::new(),
        created_time: now,
        updated_time: now,
        approximate_last_used_time: now,
        expiration_time: now + ttl,
    }
}

pub fn target(id: &str, name: &str) -> Target {
    Target {
        id: id.to_string(),
        scope_id: "p_1234567890".to_string(),
        name: name.to_string(),
        kind: "tcp".to_string(),
        session_max_seconds: 28800,
        session_connection_limit: -1,
        authorized_actions: vec!["authorize-session".to_string()],
        ..Default::default()
    }
}

pub fn session(id: &str, target_id: &str) -> Session {
    Session {
        id: id.to_string(),
        target_id: target_id.to_string(),
        status: "active".to_string(),
        kind: "tcp".to_string(),
        ..Default::default()
    }
}

pub async fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path(), false).await.unwrap()
}

pub async fn open_repository(
    dir: &TempDir,
    keyring: Arc<MemoryKeyring>,
    controller: &Arc<FakeController>,
) -> Repository {
    Repository::new(open_store(dir).await, keyring, controller.token_reader())
}

/// Resources of one type for one auth token, versioned so cursors can
/// express deltas.
struct Feed<T> {
    version: u64,
    items: BTreeMap<String, (u64, T)>,
    removed: Vec<(u64, String)>,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            version: 0,
            items: BTreeMap::new(),
            removed: Vec::new(),
        }
    }
}

impl<T: CacheableResource> Feed<T> {
    fn put(&mut self, item: T) {
        self.version += 1;
        self.items
            .insert(item.id().to_string(), (self.version, item));
    }

    fn remove(&mut self, id: &str) {
        self.version += 1;
        if self.items.remove(id).is_some() {
            self.removed.push((self.version, id.to_string()));
        }
    }

    fn fetch(&self, cursor: &RefreshTokenValue) -> Result<Retrieved<T>> {
        let next = RefreshTokenValue::new(format!("v{}", self.version));
        if cursor.is_empty() {
            let all = self.items.values().map(|(_, item)| item.clone()).collect();
            return Ok(Retrieved::new(all, Vec::new(), next));
        }

        let since: u64 = cursor
            .as_str()
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::InvalidRefreshToken(cursor.as_str().to_string()))?;

        let upserted = self
            .items
            .values()
            .filter(|(changed, _)| *changed > since)
            .map(|(_, item)| item.clone())
            .collect();
        let removed_ids = self
            .removed
            .iter()
            .filter(|(changed, _)| *changed > since)
            .map(|(_, id)| id.clone())
            .collect();
        Ok(Retrieved::new(upserted, removed_ids, next))
    }
}

/// In-process stand-in for the controller's token and listing endpoints.
#[derive(Default)]
pub struct FakeController {
    /// Raw token to auth token.
    tokens: DashMap<String, AuthToken>,
    targets: Mutex<BTreeMap<String, Feed<Target>>>,
    sessions: Mutex<BTreeMap<String, Feed<Session>>>,
    unsupported: AtomicBool,
    reject_cursors: AtomicBool,
    target_cursors_seen: Mutex<Vec<String>>,
    reader_calls: AtomicUsize,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `raw` authenticate as `token`.
    pub fn issue(&self, raw: &str, token: AuthToken) {
        self.tokens.insert(raw.to_string(), token);
    }

    pub fn revoke(&self, raw: &str) {
        self.tokens.remove(raw);
    }

    pub fn put_target(&self, auth_token_id: &str, item: Target) {
        self.targets
            .lock()
            .entry(auth_token_id.to_string())
            .or_default()
            .put(item);
    }

    pub fn remove_target(&self, auth_token_id: &str, id: &str) {
        self.targets
            .lock()
            .entry(auth_token_id.to_string())
            .or_default()
            .remove(id);
    }

    pub fn put_session(&self, auth_token_id: &str, item: Session) {
        self.sessions
            .lock()
            .entry(auth_token_id.to_string())
            .or_default()
            .put(item);
    }

    /// Controller stops (or starts) issuing refresh cursors.
    pub fn set_unsupported(&self, unsupported: bool) {
        self.unsupported.store(unsupported, Ordering::SeqCst);
    }

    pub fn set_reject_cursors(&self, reject: bool) {
        self.reject_cursors.store(reject, Ordering::SeqCst);
    }

    pub fn target_cursors_seen(&self) -> Vec<String> {
        self.target_cursors_seen.lock().clone()
    }

    pub fn reader_calls(&self) -> usize {
        self.reader_calls.load(Ordering::SeqCst)
    }

    pub fn token_reader(self: &Arc<Self>) -> TokenReaderFn {
        let this = self.clone();
        TokenReaderFn::new(move |_address, raw| {
            let this = this.clone();
            async move {
                this.reader_calls.fetch_add(1, Ordering::SeqCst);
                match this.tokens.get(&raw) {
                    Some(token) => Ok(Some(token.clone())),
                    None => Err(Error::unauthenticated("token rejected by controller")),
                }
            }
        })
    }

    pub fn target_fn(self: &Arc<Self>) -> RetrievalFn<Target> {
        let this = self.clone();
        RetrievalFn::new(move |_address, raw, cursor| {
            let this = this.clone();
            async move {
                this.target_cursors_seen
                    .lock()
                    .push(cursor.as_str().to_string());
                let Some(id) = this.check(&raw, &cursor)? else {
                    return Ok(Retrieved::empty());
                };
                match this.targets.lock().get(&id) {
                    Some(feed) => feed.fetch(&cursor),
                    None => Feed::default().fetch(&cursor),
                }
            }
        })
    }

    pub fn session_fn(self: &Arc<Self>) -> RetrievalFn<Session> {
        let this = self.clone();
        RetrievalFn::new(move |_address, raw, cursor| {
            let this = this.clone();
            async move {
                let Some(id) = this.check(&raw, &cursor)? else {
                    return Ok(Retrieved::empty());
                };
                match this.sessions.lock().get(&id) {
                    Some(feed) => feed.fetch(&cursor),
                    None => Feed::default().fetch(&cursor),
                }
            }
        })
    }

    pub fn refresh_options(self: &Arc<Self>) -> RefreshOptions {
        RefreshOptions::new()
            .with_target_retrieval_fn(self.target_fn())
            .with_session_retrieval_fn(self.session_fn())
    }

    /// Auth token id for `raw`, or `None` for a token this controller does not know.
    fn check(&self, raw: &str, cursor: &RefreshTokenValue) -> Result<Option<String>> {
        if self.unsupported.load(Ordering::SeqCst) {
            return Err(Error::RefreshNotSupported);
        }
        if !cursor.is_empty() && self.reject_cursors.load(Ordering::SeqCst) {
            return Err(Error::InvalidRefreshToken(format!(
                "cursor {} is no longer valid",
                cursor.as_str()
            )));
        }
        Ok(self.tokens.get(raw).map(|t| t.id.clone()))
    }
}
