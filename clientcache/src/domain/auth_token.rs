//! Auth token and keyring token entities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix carried by every auth token id.
pub const AUTH_TOKEN_ID_PREFIX: &str = "at_";

const AUTH_TOKEN_ID_SUFFIX_LEN: usize = 10;

/// Check that `id` has the shape `at_` followed by ten ASCII alphanumerics.
pub fn is_valid_auth_token_id(id: &str) -> bool {
    match id.strip_prefix(AUTH_TOKEN_ID_PREFIX) {
        Some(suffix) => {
            suffix.len() == AUTH_TOKEN_ID_SUFFIX_LEN
                && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// A controller-verified credential snapshot.
///
/// `token` is the raw bearer string. It is never written to the store and is
/// skipped when serialized.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: String,
    pub user_id: String,
    pub auth_method_id: String,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub approximate_last_used_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
}

impl AuthToken {
    /// Check if the token has passed its expiration time.
    pub fn is_expired(&self) -> bool {
        self.expiration_time <= Utc::now()
    }

    /// Copy of this token without the raw token string.
    pub fn without_secret(&self) -> Self {
        Self {
            token: String::new(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("auth_method_id", &self.auth_method_id)
            .field("token", &"[REDACTED]")
            .field("created_time", &self.created_time)
            .field("updated_time", &self.updated_time)
            .field("approximate_last_used_time", &self.approximate_last_used_time)
            .field("expiration_time", &self.expiration_time)
            .finish()
    }
}

/// Identifies one principal's credential stored in an OS keyring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyringToken {
    /// Controller address the credential belongs to.
    pub address: String,
    /// Keyring backend name (e.g. "keychain", "secret-service").
    pub keyring_type: String,
    /// Entry name inside the keyring.
    pub token_name: String,
    pub auth_token_id: String,
}

impl KeyringToken {
    pub fn new(
        address: impl Into<String>,
        keyring_type: impl Into<String>,
        token_name: impl Into<String>,
        auth_token_id: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            keyring_type: keyring_type.into(),
            token_name: token_name.into(),
            auth_token_id: auth_token_id.into(),
        }
    }

    /// Validate required fields.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::invalid_argument("address is empty"));
        }
        if self.keyring_type.is_empty() {
            return Err(Error::invalid_argument("keyring type is empty"));
        }
        if self.token_name.is_empty() {
            return Err(Error::invalid_argument("token name is empty"));
        }
        if self.auth_token_id.is_empty() {
            return Err(Error::invalid_argument("auth token id is empty"));
        }
        if !is_valid_auth_token_id(&self.auth_token_id) {
            return Err(Error::invalid_argument(format!(
                "malformed auth token id: {}",
                self.auth_token_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expiration: DateTime<Utc>) -> AuthToken {
        let now = Utc::now();
        AuthToken {
            id: "at_1234567890".to_string(),
            user_id: "u_1234567890".to_string(),
            auth_method_id: "ampw_1234567890".to_string(),
            token: "secret".to_string(),
            created_time: now,
            updated_time: now,
            approximate_last_used_time: now,
            expiration_time: expiration,
        }
    }

    #[test]
    fn test_auth_token_id_shape() {
        assert!(is_valid_auth_token_id("at_1234567890"));
        assert!(is_valid_auth_token_id("at_AbCdE12345"));
        assert!(!is_valid_auth_token_id("at_123456789"));
        assert!(!is_valid_auth_token_id("at_12345678901"));
        assert!(!is_valid_auth_token_id("invalid id"));
        assert!(!is_valid_auth_token_id("at_12345-7890"));
        assert!(!is_valid_auth_token_id(""));
    }

    #[test]
    fn test_expiry() {
        assert!(!token(Utc::now() + Duration::hours(1)).is_expired());
        assert!(token(Utc::now() - Duration::seconds(1)).is_expired());
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", token(Utc::now()));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_serialize_skips_token() {
        let json = serde_json::to_string(&token(Utc::now())).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_keyring_token_validation() {
        let ok = KeyringToken::new("http://127.0.0.1:9200", "keychain", "default", "at_1234567890");
        assert!(ok.validate().is_ok());

        let mut missing = ok.clone();
        missing.token_name.clear();
        assert!(missing.validate().unwrap_err().is_invalid_argument());

        let mut malformed = ok.clone();
        malformed.auth_token_id = "bogus".to_string();
        assert!(malformed.validate().unwrap_err().is_invalid_argument());
    }
}
