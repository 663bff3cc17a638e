//! Token sources.
//!
//! # Architecture
//!
//! - [`KeyringReader`]: reads raw tokens out of an OS credential store
//! - [`MemoryKeyring`]: in-process keyring for embedders and tests
//! - [`TokenReaderFn`]: validates a raw token against the controller

mod keyring;
mod reader;

pub use keyring::{KeyringReader, MemoryKeyring};
#[cfg(feature = "system-keyring")]
pub use keyring::SystemKeyring;
pub use reader::{TokenReaderFn, TokenReaderFuture};
