//! Local query surface.
//!
//! JSON over the daemon's Unix socket. Errors use a `{code, message}` body.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;

use crate::Error;
use crate::cache::{Principal, PrincipalSource};
use crate::domain::{AuthToken, KeyringToken, ResourceType, Session, SupportState, Target};

use super::server::{ServeContext, Shared};

/// Requests handled at once.
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// API error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        if err.is_not_supported() {
            return ApiError::new(
                StatusCode::CONFLICT,
                "REFRESH_NOT_SUPPORTED",
                err.to_string(),
            );
        }
        match err {
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{} with id '{}' not found", entity_type, id))
            }
            Error::InvalidArgument(msg) => ApiError::bad_request(msg),
            Error::Validation(msg) => ApiError::validation(msg),
            Error::Unauthenticated(msg) => ApiError::unauthorized(msg),
            Error::InvalidStateTransition { from, to } => {
                ApiError::conflict(format!("Cannot transition from {} to {}", from, to))
            }
            Error::Cancelled => ApiError::service_unavailable("Cache server is shutting down"),
            Error::RefreshFailed(failures) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "REFRESH_FAILED",
                failures.to_string(),
            ),
            Error::DatabaseSqlx(e) => {
                tracing::error!("Database error: {}", e);
                ApiError::internal("Database error occurred")
            }
            _ => {
                tracing::error!("Unexpected error: {}", err);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub(crate) struct ApiState {
    ctx: Arc<ServeContext>,
    shared: Arc<Shared>,
}

/// Build the query router.
pub(crate) fn router(ctx: Arc<ServeContext>, shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/targets", get(list_targets))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/tokens", post(add_token))
        .route("/v1/refresh", post(refresh))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .with_state(ApiState { ctx, shared })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScopeStatus {
    pub resource_type: ResourceType,
    pub count: usize,
    pub support_state: SupportState,
    pub has_cursor: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrincipalStatus {
    pub address: String,
    pub auth_token_id: String,
    pub keyringless: bool,
    pub scopes: Vec<ScopeStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub refresh_interval_secs: i64,
    pub recheck_support_interval_secs: i64,
    pub randomization_factor: f64,
    pub principals: Vec<PrincipalStatus>,
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<StatusResponse>> {
    let repo = &state.ctx.repo;
    let mut principals = Vec::new();

    for principal in repo.list_principals().await? {
        let mut scopes = Vec::new();
        for resource_type in ResourceType::ALL {
            let scope = principal.scope(resource_type);
            scopes.push(ScopeStatus {
                resource_type,
                count: repo.list_cached_ids(&scope).await?.len(),
                support_state: repo.get_support_state(&scope).await?,
                has_cursor: !repo.get_refresh_cursor(&scope).await?.is_empty(),
            });
        }
        principals.push(PrincipalStatus {
            keyringless: principal.source == PrincipalSource::Keyringless,
            address: principal.address,
            auth_token_id: principal.auth_token_id,
            scopes,
        });
    }

    Ok(Json(StatusResponse {
        state: state.shared.state().to_string(),
        started_at: state.ctx.started_at,
        refresh_interval_secs: state.ctx.refresh_interval.num_seconds(),
        recheck_support_interval_secs: state.ctx.recheck_support_interval.num_seconds(),
        randomization_factor: state.ctx.randomization_factor,
        principals,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub auth_token_id: String,
}

async fn find_principal(state: &ApiState, auth_token_id: &str) -> ApiResult<Principal> {
    state
        .ctx
        .repo
        .list_principals()
        .await?
        .into_iter()
        .find(|p| p.auth_token_id == auth_token_id)
        .ok_or_else(|| ApiError::not_found(format!("no principal for auth token '{auth_token_id}'")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TargetsResponse {
    pub targets: Vec<Target>,
}

async fn list_targets(
    State(state): State<ApiState>,
    Query(query): Query<ResourceQuery>,
) -> ApiResult<Json<TargetsResponse>> {
    let principal = find_principal(&state, &query.auth_token_id).await?;
    let targets = state
        .ctx
        .repo
        .list_targets(&principal.address, &principal.auth_token_id)
        .await?;
    Ok(Json(TargetsResponse { targets }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<Session>,
}

async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<ResourceQuery>,
) -> ApiResult<Json<SessionsResponse>> {
    let principal = find_principal(&state, &query.auth_token_id).await?;
    let sessions = state
        .ctx
        .repo
        .list_sessions(&principal.address, &principal.auth_token_id)
        .await?;
    Ok(Json(SessionsResponse { sessions }))
}

/// Token registration. Either `keyring_type` and `token_name`, or a raw `token`.
#[derive(Debug, Deserialize)]
pub struct AddTokenRequest {
    pub address: String,
    pub auth_token_id: String,
    #[serde(default)]
    pub keyring_type: Option<String>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

async fn add_token(
    State(state): State<ApiState>,
    Json(request): Json<AddTokenRequest>,
) -> ApiResult<(StatusCode, Json<AuthToken>)> {
    state.shared.ensure_running()?;
    let repo = &state.ctx.repo;

    let auth_token = match (request.keyring_type, request.token_name, request.token) {
        (Some(keyring_type), Some(token_name), _) => {
            repo.add_keyring_token(
                &request.address,
                KeyringToken::new(
                    &request.address,
                    keyring_type,
                    token_name,
                    &request.auth_token_id,
                ),
            )
            .await?
        }
        (None, None, Some(token)) => {
            repo.add_raw_token(&request.address, &token, &request.auth_token_id)
                .await?
        }
        _ => {
            return Err(ApiError::bad_request(
                "either keyring_type and token_name, or token, is required",
            ));
        }
    };

    state.ctx.trigger.notify_one();
    Ok((StatusCode::CREATED, Json(auth_token.without_secret())))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub status: String,
}

async fn refresh(State(state): State<ApiState>) -> ApiResult<Json<RefreshResponse>> {
    state.shared.ensure_running()?;
    state
        .ctx
        .service
        .refresh(&state.ctx.retrieval, &state.shared.cancel)
        .await?;
    Ok(Json(RefreshResponse {
        status: "ok".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Repository;
    use crate::daemon::DaemonState;
    use crate::database::Store;
    use crate::refresh::{
        FailureKind, RefreshFailure, RefreshFailures, RefreshOptions, RefreshService,
    };
    use crate::tokens::{MemoryKeyring, TokenReaderFn};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeDelta;
    use parking_lot::RwLock;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const TOKEN_ID: &str = "at_1234567890";

    async fn test_router(dir: &tempfile::TempDir, state: DaemonState) -> Router {
        let store = Store::open(dir.path(), false).await.unwrap();
        let reader = TokenReaderFn::new(|_address, raw: String| async move {
            if raw != "raw-token" {
                return Err(Error::unauthenticated("unknown token"));
            }
            let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
            Ok(Some(AuthToken {
                id: TOKEN_ID.to_string(),
                user_id: "u_1234567890".to_string(),
                auth_method_id: "ampw_1234567890".to_string(),
                token: String::new(),
                created_time: now,
                updated_time: now,
                approximate_last_used_time: now,
                expiration_time: now + TimeDelta::hours(1),
            }))
        });
        let repo = Arc::new(Repository::new(store, Arc::new(MemoryKeyring::new()), reader));

        let ctx = Arc::new(ServeContext {
            service: RefreshService::new(repo.clone()),
            repo,
            retrieval: RefreshOptions::new(),
            trigger: Arc::new(Notify::new()),
            started_at: Utc::now(),
            refresh_interval: TimeDelta::minutes(5),
            recheck_support_interval: TimeDelta::hours(1),
            randomization_factor: 0.2,
        });
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            cancel: CancellationToken::new(),
        });
        router(ctx, shared)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_lists_registered_principals() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&dir, DaemonState::Running).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/tokens",
                serde_json::json!({
                    "address": "https://controller",
                    "auth_token_id": TOKEN_ID,
                    "token": "raw-token",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let status: StatusResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(status.state, "running");
        assert_eq!(status.principals.len(), 1);
        assert!(status.principals[0].keyringless);
        assert_eq!(status.principals[0].scopes.len(), 2);
        assert!(
            status.principals[0]
                .scopes
                .iter()
                .all(|s| s.count == 0 && s.support_state == SupportState::Unknown)
        );
    }

    #[tokio::test]
    async fn test_token_registration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&dir, DaemonState::Running).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/tokens",
                serde_json::json!({ "address": "https://controller", "auth_token_id": TOKEN_ID }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/tokens",
                serde_json::json!({
                    "address": "https://controller",
                    "auth_token_id": TOKEN_ID,
                    "token": "wrong",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_unknown_principal_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&dir, DaemonState::Running).await;

        let response = app
            .oneshot(
                Request::get("/v1/sessions?auth_token_id=at_0000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_refresh_rejected_unless_running() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(&dir, DaemonState::ShuttingDown).await;

        let response = app
            .oneshot(
                Request::post("/v1/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "CONFLICT");
    }

    #[test]
    fn test_api_error_creation() {
        let err = ApiError::not_found("Token not found");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NOT_FOUND");
        assert_eq!(err.message, "Token not found");
    }

    #[test]
    fn test_error_mapping() {
        let err: ApiError = Error::not_found("auth token", "at_1234567890").into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = Error::invalid_argument("malformed").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = Error::unauthenticated("revoked").into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_not_supported_has_its_own_code() {
        let principal = Principal {
            address: "addr".to_string(),
            auth_token_id: "at_1234567890".to_string(),
            source: PrincipalSource::Keyringless,
        };
        let mut failures = RefreshFailures::default();
        failures.push(RefreshFailure::new(
            &principal,
            Some(ResourceType::Target),
            FailureKind::NotSupported,
            &Error::RefreshNotSupported,
        ));

        let err: ApiError = Error::RefreshFailed(failures).into();
        assert_eq!(err.code, "REFRESH_NOT_SUPPORTED");
        assert!(err.message.contains("not supported for this controller"));
    }
}
