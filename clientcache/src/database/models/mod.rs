//! Database models for clientcache.
//!
//! These models map directly to the database schema. Timestamps are stored
//! as epoch milliseconds and converted at the domain boundary.

pub mod auth_token;
pub mod keyring_token;
pub mod refresh_state;
pub mod resource;

pub use auth_token::*;
pub use keyring_token::*;
pub use refresh_state::*;
pub use resource::*;
