//! Cached resource database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::domain::{CacheableResource, Scope};

/// One cached controller resource stored as a JSON item.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CachedResourceDbModel {
    pub address: String,
    pub auth_token_id: String,
    pub resource_type: String,
    pub id: String,
    pub name: String,
    pub description: String,
    /// JSON serialized resource.
    pub item: String,
    pub updated_at: i64,
}

impl CachedResourceDbModel {
    pub fn encode<T: CacheableResource>(scope: &Scope, resource: &T, now_ms: i64) -> Result<Self> {
        Ok(Self {
            address: scope.address.clone(),
            auth_token_id: scope.auth_token_id.clone(),
            resource_type: scope.resource_type.as_str().to_string(),
            id: resource.id().to_string(),
            name: resource.name().to_string(),
            description: resource.description().to_string(),
            item: serde_json::to_string(resource)?,
            updated_at: now_ms,
        })
    }

    pub fn decode<T: CacheableResource>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.item)?)
    }
}
