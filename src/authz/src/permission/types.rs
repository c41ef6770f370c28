use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AuthzError, Result};
use crate::types::{Action, Conditions, FieldVisibility, PermissionId, ResourceId, ResourceType, TenantId};

/// Resource path that covers every resource of the permission's type
pub const TENANT_WIDE_PATH: &str = "/";

/// What a permission applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionTarget<'a> {
    /// Every resource of the type (`resource_path == "/"`)
    General,
    /// One specific resource
    Resource(ResourceId),
    /// Every resource of the type below a materialized path
    Path(&'a str),
}

/// Stored permission definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub resource_id: Option<ResourceId>,
    pub resource_path: Option<String>,
    pub actions: BTreeSet<Action>,
    /// Opaque, passed through to a caller-supplied evaluator
    pub conditions: Option<Conditions>,
    pub field_permissions: BTreeMap<String, FieldVisibility>,
    pub version: u32,
    pub supersedes: Option<PermissionId>,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn target(&self) -> PermissionTarget<'_> {
        match (&self.resource_id, &self.resource_path) {
            (Some(id), _) => PermissionTarget::Resource(*id),
            (None, Some(path)) if path == TENANT_WIDE_PATH => PermissionTarget::General,
            (None, Some(path)) => PermissionTarget::Path(path),
            // Unreachable for validated definitions; treat as the narrowest target
            (None, None) => PermissionTarget::Path(""),
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.conditions.as_ref().map_or(false, |c| !c.is_empty())
    }
}

/// Input for defining or revising a permission
#[derive(Debug, Clone)]
pub struct NewPermission {
    pub resource_type: ResourceType,
    pub resource_id: Option<ResourceId>,
    pub resource_path: Option<String>,
    pub actions: BTreeSet<Action>,
    pub conditions: Option<Conditions>,
    pub field_permissions: BTreeMap<String, FieldVisibility>,
}

impl NewPermission {
    /// Grants `actions` on every resource of `resource_type`
    pub fn general(resource_type: ResourceType, actions: impl IntoIterator<Item = Action>) -> Self {
        Self::for_path(resource_type, TENANT_WIDE_PATH, actions)
    }

    /// Grants `actions` on a single resource
    pub fn for_resource(
        resource_type: ResourceType,
        resource_id: ResourceId,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: Some(resource_id),
            resource_path: None,
            actions: actions.into_iter().collect(),
            conditions: None,
            field_permissions: BTreeMap::new(),
        }
    }

    /// Grants `actions` on every resource of the type below `path`
    pub fn for_path(
        resource_type: ResourceType,
        path: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: None,
            resource_path: Some(path.into()),
            actions: actions.into_iter().collect(),
            conditions: None,
            field_permissions: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, visibility: FieldVisibility) -> Self {
        self.field_permissions.insert(field.into(), visibility);
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Exactly one of resource_id / resource_path, a well-formed path, non-empty actions
    pub fn validate(&self) -> Result<()> {
        match (&self.resource_id, &self.resource_path) {
            (Some(_), Some(_)) => {
                return Err(AuthzError::MalformedPermission(
                    "both resource_id and resource_path are set".to_string(),
                ))
            }
            (None, None) => {
                return Err(AuthzError::MalformedPermission(
                    "one of resource_id or resource_path must be set".to_string(),
                ))
            }
            (None, Some(path)) if !path.starts_with('/') || !path.ends_with('/') => {
                return Err(AuthzError::MalformedPermission(format!(
                    "resource_path '{}' must start and end with '/'",
                    path
                )))
            }
            _ => {}
        }

        if self.actions.is_empty() {
            return Err(AuthzError::MalformedPermission("actions cannot be empty".to_string()));
        }

        if self.field_permissions.keys().any(|f| f.trim().is_empty()) {
            return Err(AuthzError::MalformedPermission("field names cannot be empty".to_string()));
        }

        Ok(())
    }
}
