//! Resource tree types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ResourceId, ResourceType, TenantId};

/// Node of a tenant's product hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub name: String,
    pub parent_id: Option<ResourceId>,
    /// `/{root_id}/.../{id}/`
    pub path: String,
    /// Hex BLAKE3 digest of `path`
    pub path_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// Whether `self` sits at or below the node with materialized path `prefix`
    pub fn is_under(&self, prefix: &str) -> bool {
        self.path.starts_with(prefix)
    }
}

/// Input for [`crate::resource::ResourceCatalog::create_resource`]
#[derive(Debug, Clone)]
pub struct NewResource {
    pub resource_type: ResourceType,
    pub name: String,
    pub parent_id: Option<ResourceId>,
}

impl NewResource {
    pub fn root(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
            parent_id: None,
        }
    }

    pub fn child(resource_type: ResourceType, name: impl Into<String>, parent_id: ResourceId) -> Self {
        Self {
            resource_type,
            name: name.into(),
            parent_id: Some(parent_id),
        }
    }
}

pub(crate) fn path_hash(path: &str) -> String {
    blake3::hash(path.as_bytes()).to_hex().to_string()
}

pub(crate) fn child_path(parent_path: Option<&str>, id: ResourceId) -> String {
    match parent_path {
        Some(parent) => format!("{}{}/", parent, id),
        None => format!("/{}/", id),
    }
}
