//! Core authorization types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AuthzError;

/// Unique tenant identifier
pub type TenantId = Uuid;

/// Unique user identifier
pub type UserId = Uuid;

/// Unique resource identifier
pub type ResourceId = Uuid;

/// Unique role identifier
pub type RoleId = Uuid;

/// Unique group identifier
pub type GroupId = Uuid;

/// Unique permission identifier
pub type PermissionId = Uuid;

/// Opaque key-value predicate attached to a permission.
///
/// Interpreted only by a caller-supplied evaluator.
pub type Conditions = serde_json::Map<String, serde_json::Value>;

/// Merged field visibility: resource key (`entity` or `entity:<id>`) -> field -> visibility
pub type FieldPermissions = BTreeMap<String, BTreeMap<String, FieldVisibility>>;

/// Kind of node in the resource tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ProductFamily,
    App,
    Capability,
    Service,
    Entity,
    Page,
    Api,
}

impl ResourceType {
    /// Every resource type, in tree order
    pub const ALL: [ResourceType; 7] = [
        Self::ProductFamily,
        Self::App,
        Self::Capability,
        Self::Service,
        Self::Entity,
        Self::Page,
        Self::Api,
    ];

    /// Wire name used in scope strings
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductFamily => "product_family",
            Self::App => "app",
            Self::Capability => "capability",
            Self::Service => "service",
            Self::Entity => "entity",
            Self::Page => "page",
            Self::Api => "api",
        }
    }

    /// Depth of this type in the product hierarchy (leaves share the deepest level)
    pub fn level(&self) -> u8 {
        match self {
            Self::ProductFamily => 0,
            Self::App => 1,
            Self::Capability => 2,
            Self::Service => 3,
            Self::Entity | Self::Page | Self::Api => 4,
        }
    }

    /// Whether a node of this type may parent a node of `child` type
    pub fn can_contain(&self, child: ResourceType) -> bool {
        child.level() > self.level()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AuthzError::InvalidInput(format!("unknown resource type '{}'", s)))
    }
}

/// Verb a permission grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Execute,
    Approve,
    Reject,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Self::Create,
        Self::Read,
        Self::Update,
        Self::Delete,
        Self::Execute,
        Self::Approve,
        Self::Reject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Execute => "execute",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| AuthzError::InvalidInput(format!("unknown action '{}'", s)))
    }
}

/// Per-field visibility classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldVisibility {
    Visible,
    Masked,
    Hidden,
}

impl FieldVisibility {
    /// hidden > masked > visible
    pub fn restrictiveness(&self) -> u8 {
        match self {
            Self::Visible => 0,
            Self::Masked => 1,
            Self::Hidden => 2,
        }
    }

    /// The more restrictive of two visibilities
    pub fn most_restrictive(self, other: Self) -> Self {
        if other.restrictiveness() > self.restrictiveness() {
            other
        } else {
            self
        }
    }
}

/// An assignment's expiry, if set, must be strictly after its grant time
pub(crate) fn check_expiry(granted_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> Result<(), AuthzError> {
    match expires_at {
        Some(expires) if expires <= granted_at => Err(AuthzError::InvalidInput(format!(
            "expires_at {} must be after granted_at {}",
            expires, granted_at
        ))),
        _ => Ok(()),
    }
}

/// Expired assignments are treated as absent
pub(crate) fn is_live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |expires| now < expires)
}
