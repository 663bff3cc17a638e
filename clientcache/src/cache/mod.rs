//! Client cache repository.
//!
//! [`Repository`] owns every piece of persisted state (auth token snapshots,
//! keyring tokens, cached resources and refresh state) plus the in-memory
//! keyringless tokens and the per-scope lock registry.

mod repository;

pub use repository::{DEFAULT_TOKEN_STALENESS, Principal, PrincipalSource, Repository};
