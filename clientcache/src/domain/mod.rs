//! Domain layer for clientcache.
//!
//! Entities and value objects shared by the repository, the refresh
//! service and the daemon.

pub mod auth_token;
pub mod refresh;
pub mod resource;

pub use auth_token::{AuthToken, KeyringToken, is_valid_auth_token_id};
pub use refresh::{RefreshTokenValue, Scope, SupportState};
pub use resource::{CacheableResource, ResourceType, Session, Target};
