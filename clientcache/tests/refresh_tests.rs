//! Refresh passes against a fake controller.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use clientcache::Error;
use clientcache::cache::Repository;
use clientcache::domain::{KeyringToken, RefreshTokenValue, ResourceType, Scope, SupportState, Target};
use clientcache::refresh::{FailureKind, RefreshOptions, RefreshService, RetrievalFn, Retrieved};
use clientcache::tokens::{MemoryKeyring, TokenReaderFn};

use common::*;

struct Fixture {
    _dir: tempfile::TempDir,
    keyring: Arc<MemoryKeyring>,
    controller: Arc<FakeController>,
    repo: Arc<Repository>,
    service: RefreshService,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let keyring = Arc::new(MemoryKeyring::new());
        let controller = FakeController::new();
        let repo = Arc::new(open_repository(&dir, keyring.clone(), &controller).await);
        Self {
            _dir: dir,
            keyring,
            service: RefreshService::new(repo.clone()),
            controller,
            repo,
        }
    }

    async fn register(&self, n: u32) -> String {
        let id = token_id(n);
        let raw = format!("raw-{n}");
        let name = format!("default-{n}");
        self.controller
            .issue(&raw, auth_token(&id, TimeDelta::hours(8)));
        self.keyring.set(KEYRING_TYPE, &name, &raw);
        self.repo
            .add_keyring_token(ADDRESS, KeyringToken::new(ADDRESS, KEYRING_TYPE, &name, &id))
            .await
            .unwrap();
        id
    }

    fn target_scope(&self, id: &str) -> Scope {
        Scope::new(ADDRESS, id, ResourceType::Target)
    }

    async fn target_ids(&self, id: &str) -> Vec<String> {
        let mut ids = self.repo.list_cached_ids(&self.target_scope(id)).await.unwrap();
        ids.sort();
        ids
    }
}

#[tokio::test]
async fn test_full_then_incremental_refresh() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let opts = fx.controller.refresh_options();
    let cancel = CancellationToken::new();

    fx.controller.put_target(&id, target("t_1", "alpha"));
    fx.controller.put_target(&id, target("t_2", "beta"));
    fx.controller.put_session(&id, session("s_1", "t_1"));

    fx.service.refresh(&opts, &cancel).await.unwrap();
    assert_eq!(fx.target_ids(&id).await, vec!["t_1", "t_2"]);
    assert_eq!(fx.repo.list_sessions(ADDRESS, &id).await.unwrap().len(), 1);

    fx.controller.remove_target(&id, "t_1");
    fx.controller.put_target(&id, target("t_3", "gamma"));
    fx.controller.put_target(&id, target("t_2", "beta renamed"));

    fx.service.refresh(&opts, &cancel).await.unwrap();
    assert_eq!(fx.target_ids(&id).await, vec!["t_2", "t_3"]);

    let targets = fx.repo.list_targets(ADDRESS, &id).await.unwrap();
    assert!(targets.contains(&target("t_2", "beta renamed")));

    // Second pass sent the cursor issued by the first.
    assert_eq!(fx.controller.target_cursors_seen(), vec!["", "v2"]);
    assert_eq!(
        fx.repo.get_refresh_cursor(&fx.target_scope(&id)).await.unwrap().as_str(),
        "v5"
    );
    assert_eq!(
        fx.repo.get_support_state(&fx.target_scope(&id)).await.unwrap(),
        SupportState::Supported
    );
}

#[tokio::test]
async fn test_not_supported_clears_cache() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let opts = fx.controller.refresh_options();
    let cancel = CancellationToken::new();

    fx.controller.put_target(&id, target("t_1", "alpha"));
    fx.service.refresh(&opts, &cancel).await.unwrap();
    assert_eq!(fx.target_ids(&id).await, vec!["t_1"]);

    fx.controller.set_unsupported(true);
    let err = fx.service.refresh(&opts, &cancel).await.unwrap_err();

    assert!(err.is_not_supported());
    assert!(err.to_string().contains("not supported for this controller"));
    assert!(fx.target_ids(&id).await.is_empty());
    assert_eq!(
        fx.repo.get_support_state(&fx.target_scope(&id)).await.unwrap(),
        SupportState::Unsupported
    );
    assert!(
        fx.repo
            .get_refresh_cursor(&fx.target_scope(&id))
            .await
            .unwrap()
            .is_empty()
    );

    let Error::RefreshFailed(failures) = err else {
        panic!("expected an aggregate refresh failure");
    };
    assert!(failures.iter().all(|f| f.kind == FailureKind::NotSupported));
}

#[tokio::test]
async fn test_data_pass_skips_unsupported_until_recheck() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let opts = RefreshOptions::new().with_target_retrieval_fn(fx.controller.target_fn());
    let cancel = CancellationToken::new();

    fx.controller.set_unsupported(true);
    assert!(fx.service.refresh(&opts, &cancel).await.is_err());
    let calls = fx.controller.target_cursors_seen().len();

    // Data passes leave unsupported scopes alone.
    fx.controller.set_unsupported(false);
    fx.controller.put_target(&id, target("t_1", "alpha"));
    fx.service.refresh(&opts, &cancel).await.unwrap();
    assert_eq!(fx.controller.target_cursors_seen().len(), calls);
    assert!(fx.target_ids(&id).await.is_empty());

    // A recheck pass notices the upgrade and repopulates.
    fx.service.recheck_support(&opts, &cancel).await.unwrap();
    assert_eq!(fx.target_ids(&id).await, vec!["t_1"]);
    assert_eq!(
        fx.repo.get_support_state(&fx.target_scope(&id)).await.unwrap(),
        SupportState::Supported
    );

    // And then ignores the scope again.
    let calls = fx.controller.target_cursors_seen().len();
    fx.service.recheck_support(&opts, &cancel).await.unwrap();
    assert_eq!(fx.controller.target_cursors_seen().len(), calls);
}

#[tokio::test]
async fn test_unrecognised_token_leaves_cursor_untouched() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let scope = fx.target_scope(&id);
    fx.repo
        .set_refresh_cursor(&scope, &RefreshTokenValue::new("v5"))
        .await
        .unwrap();

    // Only answers for a token the principal does not hold.
    let opts = RefreshOptions::new().with_target_retrieval_fn(RetrievalFn::new(
        |_address, token: String, _cursor| async move {
            if token == "someone-else" {
                Ok(Retrieved::new(
                    vec![target("t_1", "alpha")],
                    Vec::new(),
                    RefreshTokenValue::new("v6"),
                ))
            } else {
                Ok(Retrieved::empty())
            }
        },
    ));

    fx.service
        .refresh(&opts, &CancellationToken::new())
        .await
        .unwrap();

    assert!(fx.target_ids(&id).await.is_empty());
    assert_eq!(fx.repo.get_refresh_cursor(&scope).await.unwrap().as_str(), "v5");
    assert_eq!(fx.repo.get_support_state(&scope).await.unwrap(), SupportState::Unknown);
}

#[tokio::test]
async fn test_transient_errors_keep_cache_and_support() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let scope = fx.target_scope(&id);
    let cancel = CancellationToken::new();

    fx.controller.put_target(&id, target("t_1", "alpha"));
    fx.service
        .refresh(&fx.controller.refresh_options(), &cancel)
        .await
        .unwrap();

    let failing = RefreshOptions::new().with_target_retrieval_fn(RetrievalFn::<Target>::new(
        |_address, _token, _cursor| async { Err(Error::transient("connection reset")) },
    ));
    for _ in 0..3 {
        let err = fx.service.refresh(&failing, &cancel).await.unwrap_err();
        assert!(!err.is_not_supported());
        assert!(err.to_string().contains("connection reset"));
    }

    assert_eq!(fx.target_ids(&id).await, vec!["t_1"]);
    assert_eq!(fx.repo.get_support_state(&scope).await.unwrap(), SupportState::Supported);
    assert_eq!(fx.repo.get_refresh_cursor(&scope).await.unwrap().as_str(), "v1");
}

#[tokio::test]
async fn test_rejected_cursor_falls_back_to_full_fetch() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let opts = RefreshOptions::new().with_target_retrieval_fn(fx.controller.target_fn());
    let cancel = CancellationToken::new();

    fx.controller.put_target(&id, target("t_1", "alpha"));
    fx.controller.put_target(&id, target("t_2", "beta"));
    fx.service.refresh(&opts, &cancel).await.unwrap();

    // Deleted while the controller loses its cursor history.
    fx.controller.remove_target(&id, "t_1");
    fx.controller.set_reject_cursors(true);
    fx.service.refresh(&opts, &cancel).await.unwrap();

    assert_eq!(fx.controller.target_cursors_seen(), vec!["", "v2", ""]);
    // The full listing diffed out the missing id.
    assert_eq!(fx.target_ids(&id).await, vec!["t_2"]);
    assert_eq!(
        fx.repo.get_refresh_cursor(&fx.target_scope(&id)).await.unwrap().as_str(),
        "v3"
    );
}

#[tokio::test]
async fn test_failing_principal_does_not_block_others() {
    let fx = Fixture::new().await;
    let good = fx.register(1).await;
    let bad = fx.register(2).await;
    let opts = fx.controller.refresh_options();

    fx.controller.put_target(&good, target("t_1", "alpha"));
    fx.controller.put_target(&bad, target("t_9", "omega"));
    fx.keyring.remove(KEYRING_TYPE, "default-2");

    let err = fx
        .service
        .refresh(&opts, &CancellationToken::new())
        .await
        .unwrap_err();

    let Error::RefreshFailed(failures) = err else {
        panic!("expected an aggregate refresh failure");
    };
    assert_eq!(failures.len(), 1);
    let failure = failures.iter().next().unwrap();
    assert_eq!(failure.auth_token_id, bad);
    assert_eq!(failure.kind, FailureKind::TokenResolution);

    assert_eq!(fx.target_ids(&good).await, vec!["t_1"]);
    assert!(fx.target_ids(&bad).await.is_empty());
}

#[tokio::test]
async fn test_concurrent_passes_never_regress_cursor() {
    let fx = Fixture::new().await;
    let id = fx.register(1).await;
    let scope = fx.target_scope(&id);

    let issued = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let opts = {
        let issued = issued.clone();
        let seen = seen.clone();
        RefreshOptions::new().with_target_retrieval_fn(RetrievalFn::new(
            move |_address, _token, cursor: RefreshTokenValue| {
                let issued = issued.clone();
                let seen = seen.clone();
                async move {
                    seen.lock().push(cursor.into_inner());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(Retrieved::new(
                        vec![target(&format!("t_{n}"), "item")],
                        Vec::new(),
                        RefreshTokenValue::new(format!("c{n:04}")),
                    ))
                }
            },
        ))
    };

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        fx.service.refresh(&opts, &cancel),
        fx.service.refresh(&opts, &cancel)
    );
    a.unwrap();
    b.unwrap();

    // The second fetch started only after the first committed.
    assert_eq!(*seen.lock(), vec!["".to_string(), "c0001".to_string()]);
    assert_eq!(fx.repo.get_refresh_cursor(&scope).await.unwrap().as_str(), "c0002");
}

#[tokio::test]
async fn test_cancelled_pass_does_not_start() {
    let fx = Fixture::new().await;
    fx.register(1).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx
        .service
        .refresh(&fx.controller.refresh_options(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(fx.controller.target_cursors_seen().is_empty());
}

#[tokio::test]
async fn test_cancel_abandons_hung_token_reader() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = Arc::new(MemoryKeyring::new());
    let controller = FakeController::new();
    let id = token_id(1);
    controller.issue("raw-1", auth_token(&id, TimeDelta::hours(8)));
    keyring.set(KEYRING_TYPE, "default", "raw-1");

    // Registration validates once; every later lookup hangs.
    let calls = Arc::new(AtomicUsize::new(0));
    let reader = {
        let inner = controller.token_reader();
        let calls = calls.clone();
        TokenReaderFn::new(move |address, raw| {
            let inner = inner.clone();
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if !first {
                    std::future::pending::<()>().await;
                }
                inner.read(&address, &raw).await
            }
        })
    };
    let repo = Arc::new(
        Repository::new(open_store(&dir).await, keyring.clone(), reader)
            .with_staleness(TimeDelta::zero()),
    );
    repo.add_keyring_token(ADDRESS, KeyringToken::new(ADDRESS, KEYRING_TYPE, "default", &id))
        .await
        .unwrap();

    let service = RefreshService::new(repo.clone());
    let opts = controller.refresh_options();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let result = tokio::time::timeout(Duration::from_secs(3), service.refresh(&opts, &cancel)).await;
    assert!(matches!(result, Ok(Err(Error::Cancelled))), "pass ignored cancellation");
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(controller.target_cursors_seen().is_empty());

    // The scope lock was released with the abandoned pass.
    let scope = Scope::new(ADDRESS, &id, ResourceType::Target);
    tokio::time::timeout(Duration::from_secs(1), repo.lock_scope(&scope))
        .await
        .unwrap();
}
