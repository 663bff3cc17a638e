//! Keyring access.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;

/// Reads raw auth tokens from a credential store.
#[async_trait]
pub trait KeyringReader: Send + Sync {
    /// Return the raw token stored under `token_name`, or `None` when the
    /// entry does not exist.
    async fn read_token_from_keyring(
        &self,
        keyring_type: &str,
        token_name: &str,
    ) -> Result<Option<String>>;
}

/// Keyring held in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyring {
    entries: DashMap<(String, String), String>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &self,
        keyring_type: impl Into<String>,
        token_name: impl Into<String>,
        token: impl Into<String>,
    ) {
        self.entries
            .insert((keyring_type.into(), token_name.into()), token.into());
    }

    /// Remove an entry; returns whether it existed.
    pub fn remove(&self, keyring_type: &str, token_name: &str) -> bool {
        self.entries
            .remove(&(keyring_type.to_string(), token_name.to_string()))
            .is_some()
    }
}

#[async_trait]
impl KeyringReader for MemoryKeyring {
    async fn read_token_from_keyring(
        &self,
        keyring_type: &str,
        token_name: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .entries
            .get(&(keyring_type.to_string(), token_name.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

/// Keyring backed by the platform credential store.
///
/// Feature-gated behind `system-keyring`.
#[cfg(feature = "system-keyring")]
#[derive(Debug, Clone)]
pub struct SystemKeyring {
    service: String,
}

#[cfg(feature = "system-keyring")]
impl Default for SystemKeyring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "system-keyring")]
impl SystemKeyring {
    /// Service name the CLI stores tokens under.
    const SERVICE_NAME: &str = "clientcache-auth-token";

    /// Keyring type meaning "no keyring in use".
    pub const NONE: &str = "none";

    pub fn new() -> Self {
        Self {
            service: Self::SERVICE_NAME.to_string(),
        }
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[cfg(feature = "system-keyring")]
#[async_trait]
impl KeyringReader for SystemKeyring {
    #[tracing::instrument(skip(self))]
    async fn read_token_from_keyring(
        &self,
        keyring_type: &str,
        token_name: &str,
    ) -> Result<Option<String>> {
        if keyring_type == Self::NONE {
            return Ok(None);
        }

        let service = self.service.clone();
        let user = token_name.to_string();
        let read = tokio::task::spawn_blocking(
            move || -> std::result::Result<Option<String>, keyring::Error> {
                let entry = keyring::Entry::new(&service, &user)?;
                match entry.get_password() {
                    Ok(token) => Ok(Some(token)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )
        .await
        .map_err(|e| crate::Error::Other(format!("keyring task failed: {e}")))?;

        read.map_err(|e| crate::Error::transient(format!("keyring read failed: {e}")))
    }
}
