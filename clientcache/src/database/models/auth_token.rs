//! Auth token snapshot database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::AuthToken;

/// Auth token snapshot database model.
/// The raw token string is intentionally absent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuthTokenDbModel {
    pub id: String,
    /// Controller address the token was issued by.
    pub address: String,
    pub user_id: String,
    pub auth_method_id: String,
    pub created_time: i64,
    pub updated_time: i64,
    pub approximate_last_used_time: i64,
    pub expiration_time: i64,
    /// Unix epoch milliseconds (UTC) of the last successful token reader call.
    pub last_refreshed_at: i64,
}

impl AuthTokenDbModel {
    pub fn from_domain(address: &str, token: &AuthToken, refreshed_at_ms: i64) -> Self {
        Self {
            id: token.id.clone(),
            address: address.to_string(),
            user_id: token.user_id.clone(),
            auth_method_id: token.auth_method_id.clone(),
            created_time: datetime_to_ms(token.created_time),
            updated_time: datetime_to_ms(token.updated_time),
            approximate_last_used_time: datetime_to_ms(token.approximate_last_used_time),
            expiration_time: datetime_to_ms(token.expiration_time),
            last_refreshed_at: refreshed_at_ms,
        }
    }

    /// Convert to the domain type, attaching the raw token (possibly empty).
    pub fn into_domain(self, token: String) -> AuthToken {
        AuthToken {
            id: self.id,
            user_id: self.user_id,
            auth_method_id: self.auth_method_id,
            token,
            created_time: ms_to_datetime(self.created_time),
            updated_time: ms_to_datetime(self.updated_time),
            approximate_last_used_time: ms_to_datetime(self.approximate_last_used_time),
            expiration_time: ms_to_datetime(self.expiration_time),
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expiration_time <= now_ms
    }

    /// Whether the snapshot is older than `window_ms`.
    pub fn is_stale_at(&self, now_ms: i64, window_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_refreshed_at) > window_ms
    }
}
