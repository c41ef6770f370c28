//! Groups, group inheritance, memberships and group role grants

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{Group, GroupRole, UserGroup};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::inheritance::ParentTree;
use crate::tenant::TenantContext;
use crate::types::{check_expiry, GroupId, RoleId, TenantId, UserId};

struct TenantGroups {
    groups: HashMap<GroupId, Group>,
    names: HashMap<String, GroupId>,
    tree: ParentTree<GroupId>,
    /// group -> user -> edge
    members: HashMap<GroupId, HashMap<UserId, UserGroup>>,
    /// group -> role -> edge
    roles: HashMap<GroupId, HashMap<RoleId, GroupRole>>,
}

impl TenantGroups {
    fn new(max_depth: usize) -> Self {
        Self {
            groups: HashMap::new(),
            names: HashMap::new(),
            tree: ParentTree::new(max_depth),
            members: HashMap::new(),
            roles: HashMap::new(),
        }
    }

    fn require(&self, group_id: GroupId) -> Result<&Group> {
        self.groups
            .get(&group_id)
            .ok_or_else(|| AuthzError::NotFound(format!("group {}", group_id)))
    }
}

#[derive(Default)]
struct MembershipState {
    tenants: HashMap<TenantId, TenantGroups>,
    owners: HashMap<GroupId, TenantId>,
}

impl MembershipState {
    fn check_same_tenant(&self, tenant_id: TenantId, group_id: GroupId) -> Result<()> {
        match self.owners.get(&group_id) {
            None => Err(AuthzError::NotFound(format!("group {}", group_id))),
            Some(owner) if *owner != tenant_id => Err(AuthzError::CrossTenantParent(format!(
                "group {} belongs to another tenant",
                group_id
            ))),
            Some(_) => Ok(()),
        }
    }

    fn tenant_mut(&mut self, tenant_id: TenantId) -> Result<&mut TenantGroups> {
        self.tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| AuthzError::NotFound(format!("no groups in tenant {}", tenant_id)))
    }
}

/// Owns every tenant's groups and their membership / role edges
pub struct GroupMembership {
    state: RwLock<MembershipState>,
    clock: Arc<dyn Clock>,
    max_depth: usize,
}

impl GroupMembership {
    pub fn new(clock: Arc<dyn Clock>, max_depth: usize) -> Self {
        Self {
            state: RwLock::new(MembershipState::default()),
            clock,
            max_depth,
        }
    }

    pub fn create_group(&self, ctx: &TenantContext, name: &str, parent: Option<GroupId>) -> Result<Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthzError::InvalidInput("group name cannot be empty".to_string()));
        }

        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();
        if let Some(parent) = parent {
            state.check_same_tenant(tenant_id, parent)?;
        }

        let max_depth = self.max_depth;
        let tenant = state
            .tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantGroups::new(max_depth));

        if tenant.names.contains_key(name) {
            return Err(AuthzError::Duplicate(format!("group '{}' already exists", name)));
        }

        let group = Group {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            parent_group_id: parent,
            created_at: self.clock.now(),
        };

        tenant.tree.insert(group.id, parent)?;
        tenant.names.insert(group.name.clone(), group.id);
        tenant.groups.insert(group.id, group.clone());
        state.owners.insert(group.id, tenant_id);

        info!(group_id = %group.id, tenant_id = %tenant_id, name = %group.name, "Group created");
        Ok(group)
    }

    pub fn get_group(&self, ctx: &TenantContext, id: GroupId) -> Result<Group> {
        self.state
            .read()
            .tenants
            .get(&ctx.tenant_id())
            .ok_or_else(|| AuthzError::NotFound(format!("group {}", id)))?
            .require(id)
            .cloned()
    }

    pub fn find_by_name(&self, ctx: &TenantContext, name: &str) -> Option<Group> {
        let state = self.state.read();
        let tenant = state.tenants.get(&ctx.tenant_id())?;
        tenant.names.get(name).and_then(|id| tenant.groups.get(id)).cloned()
    }

    /// Re-parent a group. Cycles and over-deep chains are rejected before commit.
    pub fn set_parent(&self, ctx: &TenantContext, group_id: GroupId, parent: Option<GroupId>) -> Result<Group> {
        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();

        state.check_same_tenant(tenant_id, group_id).map_err(|e| match e {
            AuthzError::CrossTenantParent(_) => AuthzError::NotFound(format!("group {}", group_id)),
            other => other,
        })?;
        if let Some(parent) = parent {
            state.check_same_tenant(tenant_id, parent)?;
        }

        let tenant = state.tenant_mut(tenant_id)?;
        tenant.tree.set_parent(group_id, parent)?;

        let group = tenant
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| AuthzError::NotFound(format!("group {}", group_id)))?;
        group.parent_group_id = parent;

        info!(group_id = %group_id, parent = ?parent, "Group parent changed");
        Ok(group.clone())
    }

    /// The group followed by every ancestor up to its root
    pub fn resolve_inherited_chain(&self, ctx: &TenantContext, group_id: GroupId) -> Result<Vec<GroupId>> {
        let state = self.state.read();
        let tenant = state
            .tenants
            .get(&ctx.tenant_id())
            .ok_or_else(|| AuthzError::NotFound(format!("group {}", group_id)))?;
        Ok(tenant.tree.chain(&group_id)?)
    }

    pub fn add_member(
        &self,
        ctx: &TenantContext,
        group_id: GroupId,
        user_id: UserId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserGroup> {
        let granted_at = self.clock.now();
        check_expiry(granted_at, expires_at)?;

        let mut state = self.state.write();
        let tenant = state.tenant_mut(ctx.tenant_id())?;
        tenant.require(group_id)?;

        let edge = UserGroup {
            user_id,
            group_id,
            granted_by: ctx.user_id(),
            granted_at,
            expires_at,
        };
        tenant
            .members
            .entry(group_id)
            .or_default()
            .insert(user_id, edge.clone());

        debug!(group_id = %group_id, user_id = %user_id, "Member added");
        Ok(edge)
    }

    pub fn remove_member(&self, ctx: &TenantContext, group_id: GroupId, user_id: UserId) -> bool {
        self.state
            .write()
            .tenants
            .get_mut(&ctx.tenant_id())
            .and_then(|t| t.members.get_mut(&group_id))
            .and_then(|m| m.remove(&user_id))
            .is_some()
    }

    /// Grant a role to every member of the group and of its descendant groups.
    ///
    /// The caller checks that `role_id` is a role of the same tenant.
    pub fn grant_role(
        &self,
        ctx: &TenantContext,
        group_id: GroupId,
        role_id: RoleId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GroupRole> {
        let granted_at = self.clock.now();
        check_expiry(granted_at, expires_at)?;

        let mut state = self.state.write();
        let tenant = state.tenant_mut(ctx.tenant_id())?;
        tenant.require(group_id)?;

        let edge = GroupRole {
            group_id,
            role_id,
            granted_by: ctx.user_id(),
            granted_at,
            expires_at,
        };
        tenant
            .roles
            .entry(group_id)
            .or_default()
            .insert(role_id, edge.clone());

        debug!(group_id = %group_id, role_id = %role_id, "Role granted to group");
        Ok(edge)
    }

    pub fn revoke_role(&self, ctx: &TenantContext, group_id: GroupId, role_id: RoleId) -> bool {
        self.state
            .write()
            .tenants
            .get_mut(&ctx.tenant_id())
            .and_then(|t| t.roles.get_mut(&group_id))
            .and_then(|r| r.remove(&role_id))
            .is_some()
    }

    /// Unexpired direct memberships of a user
    pub fn groups_for_user(&self, ctx: &TenantContext, user_id: UserId, now: DateTime<Utc>) -> Vec<UserGroup> {
        let state = self.state.read();
        let Some(tenant) = state.tenants.get(&ctx.tenant_id()) else {
            return Vec::new();
        };
        tenant
            .members
            .values()
            .filter_map(|members| members.get(&user_id))
            .filter(|m| m.is_live(now))
            .cloned()
            .collect()
    }

    /// Unexpired role grants on the given groups or any of their ancestors
    pub fn roles_for_groups(
        &self,
        ctx: &TenantContext,
        groups: &[GroupId],
        now: DateTime<Utc>,
    ) -> Result<Vec<GroupRole>> {
        let state = self.state.read();
        let Some(tenant) = state.tenants.get(&ctx.tenant_id()) else {
            return Ok(Vec::new());
        };

        let mut seen = BTreeSet::new();
        let mut grants = Vec::new();
        for group_id in groups {
            for ancestor in tenant.tree.chain(group_id)? {
                if !seen.insert(ancestor) {
                    continue;
                }
                if let Some(edges) = tenant.roles.get(&ancestor) {
                    grants.extend(edges.values().filter(|g| g.is_live(now)).cloned());
                }
            }
        }
        Ok(grants)
    }

    /// Current members of a group and all of its descendant groups
    pub fn affected_members(&self, ctx: &TenantContext, group_id: GroupId) -> Vec<UserId> {
        let state = self.state.read();
        let Some(tenant) = state.tenants.get(&ctx.tenant_id()) else {
            return Vec::new();
        };

        let mut users = BTreeSet::new();
        let mut frontier = vec![group_id];
        while let Some(current) = frontier.pop() {
            if let Some(members) = tenant.members.get(&current) {
                users.extend(members.keys().copied());
            }
            frontier.extend(tenant.tree.children_of(&current));
        }
        users.into_iter().collect()
    }

    /// Drop every edge that references a deleted role
    pub fn forget_role(&self, ctx: &TenantContext, role_id: RoleId) {
        if let Some(tenant) = self.state.write().tenants.get_mut(&ctx.tenant_id()) {
            for grants in tenant.roles.values_mut() {
                grants.remove(&role_id);
            }
        }
    }

    pub fn purge_tenant(&self, tenant_id: TenantId) {
        let mut state = self.state.write();
        if let Some(removed) = state.tenants.remove(&tenant_id) {
            for id in removed.groups.keys() {
                state.owners.remove(id);
            }
        }
    }
}
