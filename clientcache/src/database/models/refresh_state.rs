//! Per-scope refresh state database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{RefreshTokenValue, SupportState};

/// Cursor and support state for one `(address, auth_token_id, resource_type)` scope.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RefreshStateDbModel {
    pub address: String,
    pub auth_token_id: String,
    pub resource_type: String,
    /// Opaque cursor; empty when none has been issued.
    pub refresh_token: String,
    pub support_state: String,
    pub updated_at: i64,
}

impl RefreshStateDbModel {
    pub fn cursor(&self) -> RefreshTokenValue {
        RefreshTokenValue::new(self.refresh_token.clone())
    }

    /// Parsed support state. Unrecognised values read as `Unknown`.
    pub fn support_state(&self) -> SupportState {
        SupportState::parse(&self.support_state).unwrap_or_default()
    }
}
