//! Cached controller resources.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Resource types the cache tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Target,
    Session,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Target, ResourceType::Session];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Target => "target",
            Self::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "target" => Some(Self::Target),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A controller resource that can be stored in the cache.
///
/// Items are persisted as JSON keyed by [`CacheableResource::id`].
pub trait CacheableResource:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const RESOURCE_TYPE: ResourceType;

    fn id(&self) -> &str;

    fn name(&self) -> &str {
        ""
    }

    fn description(&self) -> &str {
        ""
    }
}

/// A target as returned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub session_max_seconds: u32,
    #[serde(default)]
    pub session_connection_limit: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_filter: Option<String>,
    #[serde(default)]
    pub authorized_actions: Vec<String>,
}

impl CacheableResource for Target {
    const RESOURCE_TYPE: ResourceType = ResourceType::Target;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// A session as returned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authorized_actions: Vec<String>,
}

impl CacheableResource for Session {
    const RESOURCE_TYPE: ResourceType = ResourceType::Session;

    fn id(&self) -> &str {
        &self.id
    }
}
