//! Refresh service.
//!
//! Drives data passes and support recheck passes across every known
//! principal and tracked resource type.
//!
//! # Architecture
//!
//! - [`RetrievalFn`]: injected controller fetch for one resource type
//! - [`RefreshOptions`]: the retrieval functions used by a pass
//! - [`RefreshFailures`]: per-principal failures aggregated over a pass
//! - [`RefreshService`]: fetch, diff and commit under the per-scope lock

mod failures;
mod retrieval;
mod service;

pub use failures::{FailureKind, RefreshFailure, RefreshFailures};
pub use retrieval::{RefreshOptions, RetrievalFn, RetrievalFuture, Retrieved};
pub use service::{MAX_CONCURRENT_PRINCIPALS, PassKind, RefreshService};
