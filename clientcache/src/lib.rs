//! clientcache library crate.
//!
//! A local daemon that keeps a per-principal copy of a controller's targets
//! and sessions, refreshed incrementally with refresh cursors.

pub mod cache;
pub mod daemon;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod refresh;
pub mod tokens;

pub use error::{Error, Result};
