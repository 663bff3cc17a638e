//! Keyring token database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::KeyringToken;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KeyringTokenDbModel {
    pub address: String,
    pub keyring_type: String,
    pub token_name: String,
    pub auth_token_id: String,
    pub created_at: i64,
}

impl From<KeyringTokenDbModel> for KeyringToken {
    fn from(model: KeyringTokenDbModel) -> Self {
        KeyringToken {
            address: model.address,
            keyring_type: model.keyring_type,
            token_name: model.token_name,
            auth_token_id: model.auth_token_id,
        }
    }
}
