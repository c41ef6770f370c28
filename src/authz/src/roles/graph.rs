//! Role graph: single-parent role inheritance plus direct user assignments

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{NewRole, Role, UserRole};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::inheritance::ParentTree;
use crate::tenant::TenantContext;
use crate::types::{check_expiry, RoleId, TenantId, UserId};

struct TenantRoles {
    roles: HashMap<RoleId, Role>,
    names: HashMap<String, RoleId>,
    tree: ParentTree<RoleId>,
    assignments: HashMap<UserId, HashMap<RoleId, UserRole>>,
}

impl TenantRoles {
    fn new(max_depth: usize) -> Self {
        Self {
            roles: HashMap::new(),
            names: HashMap::new(),
            tree: ParentTree::new(max_depth),
            assignments: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct GraphState {
    tenants: HashMap<TenantId, TenantRoles>,
    owners: HashMap<RoleId, TenantId>,
}

impl GraphState {
    fn check_same_tenant(&self, tenant_id: TenantId, role_id: RoleId) -> Result<()> {
        match self.owners.get(&role_id) {
            None => Err(AuthzError::NotFound(format!("role {}", role_id))),
            Some(owner) if *owner != tenant_id => Err(AuthzError::CrossTenantParent(format!(
                "role {} belongs to another tenant",
                role_id
            ))),
            Some(_) => Ok(()),
        }
    }

    fn tenant_mut(&mut self, tenant_id: TenantId) -> Result<&mut TenantRoles> {
        self.tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| AuthzError::NotFound(format!("no roles in tenant {}", tenant_id)))
    }
}

/// Owns every tenant's roles, role inheritance and direct user assignments
pub struct RoleGraph {
    state: RwLock<GraphState>,
    clock: Arc<dyn Clock>,
    max_depth: usize,
}

impl RoleGraph {
    pub fn new(clock: Arc<dyn Clock>, max_depth: usize) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            clock,
            max_depth,
        }
    }

    pub fn create_role(&self, ctx: &TenantContext, new: NewRole) -> Result<Role> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(AuthzError::InvalidInput("role name cannot be empty".to_string()));
        }

        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();

        if let Some(parent) = new.parent_role_id {
            state.check_same_tenant(tenant_id, parent)?;
        }

        let max_depth = self.max_depth;
        let tenant = state
            .tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantRoles::new(max_depth));

        if tenant.names.contains_key(name) {
            return Err(AuthzError::Duplicate(format!("role '{}' already exists", name)));
        }

        let role = Role {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            priority: new.priority,
            parent_role_id: new.parent_role_id,
            is_assignable: new.is_assignable,
            created_at: self.clock.now(),
        };

        tenant.tree.insert(role.id, role.parent_role_id)?;
        tenant.names.insert(role.name.clone(), role.id);
        tenant.roles.insert(role.id, role.clone());
        state.owners.insert(role.id, tenant_id);

        info!(role_id = %role.id, tenant_id = %tenant_id, name = %role.name, "Role created");
        Ok(role)
    }

    pub fn get_role(&self, ctx: &TenantContext, id: RoleId) -> Result<Role> {
        self.state
            .read()
            .tenants
            .get(&ctx.tenant_id())
            .and_then(|t| t.roles.get(&id))
            .cloned()
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", id)))
    }

    pub fn find_by_name(&self, ctx: &TenantContext, name: &str) -> Option<Role> {
        let state = self.state.read();
        let tenant = state.tenants.get(&ctx.tenant_id())?;
        tenant.names.get(name).and_then(|id| tenant.roles.get(id)).cloned()
    }

    pub fn list_roles(&self, ctx: &TenantContext) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .state
            .read()
            .tenants
            .get(&ctx.tenant_id())
            .map(|t| t.roles.values().cloned().collect())
            .unwrap_or_default();
        roles.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        roles
    }

    /// Re-parent a role. Cycles and over-deep chains are rejected before commit.
    pub fn set_parent(&self, ctx: &TenantContext, role_id: RoleId, parent: Option<RoleId>) -> Result<Role> {
        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();

        state.check_same_tenant(tenant_id, role_id).map_err(|e| match e {
            AuthzError::CrossTenantParent(_) => AuthzError::NotFound(format!("role {}", role_id)),
            other => other,
        })?;
        if let Some(parent) = parent {
            state.check_same_tenant(tenant_id, parent)?;
        }

        let tenant = state.tenant_mut(tenant_id)?;
        tenant.tree.set_parent(role_id, parent)?;

        let role = tenant
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", role_id)))?;
        role.parent_role_id = parent;

        info!(role_id = %role_id, parent = ?parent, "Role parent changed");
        Ok(role.clone())
    }

    /// The role followed by every ancestor up to its root
    pub fn resolve_inherited_chain(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Vec<RoleId>> {
        let state = self.state.read();
        let tenant = state
            .tenants
            .get(&ctx.tenant_id())
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", role_id)))?;
        Ok(tenant.tree.chain(&role_id)?)
    }

    /// Delete a role together with its direct assignments; children become roots
    pub fn delete_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Role> {
        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();
        let tenant = state.tenant_mut(tenant_id)?;

        let role = tenant
            .roles
            .remove(&role_id)
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", role_id)))?;
        tenant.names.remove(&role.name);
        for orphan in tenant.tree.remove(&role_id) {
            if let Some(child) = tenant.roles.get_mut(&orphan) {
                child.parent_role_id = None;
            }
        }
        for assignments in tenant.assignments.values_mut() {
            assignments.remove(&role_id);
        }
        state.owners.remove(&role_id);

        info!(role_id = %role_id, "Role deleted");
        Ok(role)
    }

    /// Directly assign an assignable role; `ctx.user_id()` is recorded as grantor
    pub fn assign_role(
        &self,
        ctx: &TenantContext,
        user_id: UserId,
        role_id: RoleId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRole> {
        let granted_at = self.clock.now();
        check_expiry(granted_at, expires_at)?;

        let mut state = self.state.write();
        let tenant = state.tenant_mut(ctx.tenant_id())?;
        let role = tenant
            .roles
            .get(&role_id)
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", role_id)))?;

        if !role.is_assignable {
            return Err(AuthzError::InvalidInput(format!(
                "role '{}' is not directly assignable",
                role.name
            )));
        }

        let assignment = UserRole {
            user_id,
            role_id,
            granted_by: ctx.user_id(),
            granted_at,
            expires_at,
        };
        tenant
            .assignments
            .entry(user_id)
            .or_default()
            .insert(role_id, assignment.clone());

        debug!(user_id = %user_id, role_id = %role_id, "Role assigned");
        Ok(assignment)
    }

    /// Returns whether an assignment existed
    pub fn revoke_role(&self, ctx: &TenantContext, user_id: UserId, role_id: RoleId) -> bool {
        let mut state = self.state.write();
        let removed = state
            .tenants
            .get_mut(&ctx.tenant_id())
            .and_then(|t| t.assignments.get_mut(&user_id))
            .and_then(|a| a.remove(&role_id))
            .is_some();
        if removed {
            debug!(user_id = %user_id, role_id = %role_id, "Role revoked");
        }
        removed
    }

    /// Unexpired direct role assignments of a user
    pub fn direct_roles(&self, ctx: &TenantContext, user_id: UserId, now: DateTime<Utc>) -> Vec<UserRole> {
        self.state
            .read()
            .tenants
            .get(&ctx.tenant_id())
            .and_then(|t| t.assignments.get(&user_id))
            .map(|a| a.values().filter(|ur| ur.is_live(now)).cloned().collect())
            .unwrap_or_default()
    }

    /// Priority lookup for a set of roles in the caller's tenant
    pub fn priorities(&self, ctx: &TenantContext, role_ids: &[RoleId]) -> Result<HashMap<RoleId, i32>> {
        let state = self.state.read();
        let tenant = state.tenants.get(&ctx.tenant_id());
        role_ids
            .iter()
            .map(|id| {
                tenant
                    .and_then(|t| t.roles.get(id))
                    .map(|r| (*id, r.priority))
                    .ok_or_else(|| {
                        AuthzError::ResolutionFailure(format!("role {} missing from tenant", id))
                    })
            })
            .collect()
    }

    /// Drop user's assignments, e.g. after the user is deleted
    pub fn forget_user(&self, ctx: &TenantContext, user_id: UserId) {
        if let Some(tenant) = self.state.write().tenants.get_mut(&ctx.tenant_id()) {
            tenant.assignments.remove(&user_id);
        }
    }

    pub fn purge_tenant(&self, tenant_id: TenantId) {
        let mut state = self.state.write();
        if let Some(removed) = state.tenants.remove(&tenant_id) {
            for id in removed.roles.keys() {
                state.owners.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn setup(max_depth: usize) -> (RoleGraph, Arc<ManualClock>, TenantContext) {
        let clock = Arc::new(ManualClock::default());
        let graph = RoleGraph::new(clock.clone(), max_depth);
        let ctx = TenantContext::new(Uuid::new_v4(), Uuid::new_v4(), clock.now());
        (graph, clock, ctx)
    }

    #[test]
    fn test_unique_names_per_tenant() {
        let (graph, clock, ctx) = setup(50);
        graph.create_role(&ctx, NewRole::new("manager", 80)).unwrap();
        assert!(matches!(
            graph.create_role(&ctx, NewRole::new("manager", 10)),
            Err(AuthzError::Duplicate(_))
        ));

        // Same name in another tenant is fine
        let other = TenantContext::new(Uuid::new_v4(), Uuid::new_v4(), clock.now());
        assert!(graph.create_role(&other, NewRole::new("manager", 80)).is_ok());
    }

    #[test]
    fn test_set_parent_cycle_rejected() {
        let (graph, _clock, ctx) = setup(50);
        let a = graph.create_role(&ctx, NewRole::new("a", 1)).unwrap();
        let b = graph.create_role(&ctx, NewRole::new("b", 1)).unwrap();

        graph.set_parent(&ctx, a.id, Some(b.id)).unwrap();
        let result = graph.set_parent(&ctx, b.id, Some(a.id));
        assert!(matches!(result, Err(AuthzError::CircularInheritance(_))));
        assert_eq!(graph.get_role(&ctx, b.id).unwrap().parent_role_id, None);
    }

    #[test]
    fn test_depth_bound() {
        let (graph, _clock, ctx) = setup(3);
        let r1 = graph.create_role(&ctx, NewRole::new("r1", 1)).unwrap();
        let r2 = graph.create_role(&ctx, NewRole::new("r2", 1).with_parent(r1.id)).unwrap();
        let r3 = graph.create_role(&ctx, NewRole::new("r3", 1).with_parent(r2.id)).unwrap();

        assert!(matches!(
            graph.create_role(&ctx, NewRole::new("r4", 1).with_parent(r3.id)),
            Err(AuthzError::HierarchyTooDeep(_))
        ));
        assert_eq!(graph.resolve_inherited_chain(&ctx, r3.id).unwrap(), vec![r3.id, r2.id, r1.id]);
    }

    #[test]
    fn test_cross_tenant_parent_rejected() {
        let (graph, clock, ctx) = setup(50);
        let other = TenantContext::new(Uuid::new_v4(), Uuid::new_v4(), clock.now());
        let foreign = graph.create_role(&other, NewRole::new("foreign", 1)).unwrap();
        let local = graph.create_role(&ctx, NewRole::new("local", 1)).unwrap();

        assert!(matches!(
            graph.create_role(&ctx, NewRole::new("child", 1).with_parent(foreign.id)),
            Err(AuthzError::CrossTenantParent(_))
        ));
        assert!(matches!(
            graph.set_parent(&ctx, local.id, Some(foreign.id)),
            Err(AuthzError::CrossTenantParent(_))
        ));
    }

    #[test]
    fn test_assignment_expiry() {
        let (graph, clock, ctx) = setup(50);
        let role = graph.create_role(&ctx, NewRole::new("temp", 1)).unwrap();
        let user = Uuid::new_v4();

        assert!(graph.assign_role(&ctx, user, role.id, Some(clock.now())).is_err());

        let assignment = graph
            .assign_role(&ctx, user, role.id, Some(clock.now() + Duration::minutes(10)))
            .unwrap();
        assert_eq!(assignment.granted_by, ctx.user_id());
        let live: Vec<RoleId> = graph
            .direct_roles(&ctx, user, clock.now())
            .iter()
            .map(|a| a.role_id)
            .collect();
        assert_eq!(live, vec![role.id]);

        clock.advance(Duration::minutes(10));
        assert!(graph.direct_roles(&ctx, user, clock.now()).is_empty());
    }

    #[test]
    fn test_unassignable_role() {
        let (graph, _clock, ctx) = setup(50);
        let base = graph.create_role(&ctx, NewRole::new("base", 1).not_assignable()).unwrap();
        let result = graph.assign_role(&ctx, Uuid::new_v4(), base.id, None);
        assert!(matches!(result, Err(AuthzError::InvalidInput(_))));
    }

    #[test]
    fn test_delete_role_orphans_children_and_assignments() {
        let (graph, clock, ctx) = setup(50);
        let parent = graph.create_role(&ctx, NewRole::new("parent", 1)).unwrap();
        let child = graph.create_role(&ctx, NewRole::new("child", 1).with_parent(parent.id)).unwrap();
        let user = Uuid::new_v4();
        graph.assign_role(&ctx, user, parent.id, None).unwrap();

        graph.delete_role(&ctx, parent.id).unwrap();
        assert_eq!(graph.get_role(&ctx, child.id).unwrap().parent_role_id, None);
        assert!(graph.direct_roles(&ctx, user, clock.now()).is_empty());
        assert!(graph.find_by_name(&ctx, "parent").is_none());
    }
}
