//! Repository layer for database access.
//!
//! Each repository pairs an async trait with an sqlx implementation over the
//! read pool and the serialized write pool. `*TxOps` types hold the
//! statements that must run inside a caller-owned transaction.

pub mod auth_token;
pub mod resource;

pub use auth_token::*;
pub use resource::*;
