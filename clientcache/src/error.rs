//! Application-wide error types.

use thiserror::Error;

use crate::refresh::RefreshFailures;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Message carried by [`Error::RefreshNotSupported`].
pub const REFRESH_NOT_SUPPORTED_MSG: &str = "refresh tokens are not supported for this controller";

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The controller cannot issue refresh cursors for this resource type.
    #[error("{}", REFRESH_NOT_SUPPORTED_MSG)]
    RefreshNotSupported,

    /// The controller rejected the refresh cursor that was sent.
    #[error("Invalid refresh token: {0}")]
    InvalidRefreshToken(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    RefreshFailed(RefreshFailures),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[inline]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }

    #[inline]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// True for the not-supported sentinel, or for an aggregate refresh
    /// failure in which at least one scope was not supported.
    pub fn is_not_supported(&self) -> bool {
        match self {
            Self::RefreshNotSupported => true,
            Self::RefreshFailed(failures) => failures.has_not_supported(),
            _ => false,
        }
    }
}
