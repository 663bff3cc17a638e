//! Refresh cursor, support state and cache scope.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::resource::ResourceType;

/// Opaque continuation cursor issued by the controller.
///
/// Never parsed. An empty value means "no cursor": the next fetch is a full listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshTokenValue(String);

impl RefreshTokenValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for RefreshTokenValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RefreshTokenValue {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Whether a controller honors incremental refresh for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportState {
    /// No refresh has completed yet.
    #[default]
    Unknown,
    /// The last refresh returned a cursor.
    Supported,
    /// The controller reported that it cannot issue cursors.
    Unsupported,
}

impl SupportState {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Supported => "supported",
            Self::Unsupported => "unsupported",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "supported" => Some(Self::Supported),
            "unsupported" => Some(Self::Unsupported),
            _ => None,
        }
    }
}

impl fmt::Display for SupportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of all cached state: one principal's view of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub address: String,
    pub auth_token_id: String,
    pub resource_type: ResourceType,
}

impl Scope {
    pub fn new(
        address: impl Into<String>,
        auth_token_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            address: address.into(),
            auth_token_id: auth_token_id.into(),
            resource_type,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.address,
            self.auth_token_id,
            self.resource_type.as_str()
        )
    }
}
