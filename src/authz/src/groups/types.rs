use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{is_live, GroupId, RoleId, TenantId, UserId};

/// Named set of users; inherits the roles of its ancestor groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub tenant_id: TenantId,
    pub name: String,
    pub parent_group_id: Option<GroupId>,
    pub created_at: DateTime<Utc>,
}

/// User -> group membership edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserGroup {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        is_live(self.expires_at, now)
    }
}

/// Group -> role grant edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRole {
    pub group_id: GroupId,
    pub role_id: RoleId,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GroupRole {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        is_live(self.expires_at, now)
    }
}
