use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{is_live, RoleId, TenantId, UserId};

/// Named bundle of permissions with a conflict-resolution priority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Higher wins on field-visibility conflicts
    pub priority: i32,
    pub parent_role_id: Option<RoleId>,
    pub is_assignable: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::roles::RoleGraph::create_role`]
#[derive(Debug, Clone)]
pub struct NewRole {
    pub name: String,
    pub priority: i32,
    pub parent_role_id: Option<RoleId>,
    pub is_assignable: bool,
}

impl NewRole {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            parent_role_id: None,
            is_assignable: true,
        }
    }

    pub fn with_parent(mut self, parent: RoleId) -> Self {
        self.parent_role_id = Some(parent);
        self
    }

    /// Only reachable through inheritance or group grants
    pub fn not_assignable(mut self) -> Self {
        self.is_assignable = false;
        self
    }
}

/// Direct user -> role assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserRole {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        is_live(self.expires_at, now)
    }
}
