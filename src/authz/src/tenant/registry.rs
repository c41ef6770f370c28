//! Tenant tree, user registry and session binding

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tessera_vault::TenantSalt;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{SuperadminGrant, Tenant, TenantContext, TenantType, User, UserRecord};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::types::{TenantId, UserId};

#[derive(Default)]
struct RegistryState {
    tenants: HashMap<TenantId, Tenant>,
    children: HashMap<TenantId, HashSet<TenantId>>,
    users: HashMap<UserId, User>,
    lookup_index: HashMap<(TenantId, String), UserId>,
    superadmins: HashMap<UserId, SuperadminGrant>,
}

impl RegistryState {
    fn tenant(&self, id: TenantId) -> Result<&Tenant> {
        self.tenants
            .get(&id)
            .ok_or_else(|| AuthzError::NotFound(format!("tenant {}", id)))
    }

    /// Leaf-first walk capped at `max_depth` hops
    fn walk_up(&self, id: TenantId, max_depth: usize) -> Result<Vec<TenantId>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if chain.len() >= max_depth {
                return Err(AuthzError::HierarchyTooDeep(format!(
                    "tenant {} ancestry exceeds {} levels",
                    id, max_depth
                )));
            }
            chain.push(current);
            cursor = self.tenant(current)?.parent_tenant_id;
        }
        Ok(chain)
    }

    fn effectively_active(&self, id: TenantId, max_depth: usize) -> Result<bool> {
        let chain = self.walk_up(id, max_depth)?;
        Ok(chain
            .iter()
            .all(|t| self.tenants.get(t).map(|t| t.is_active).unwrap_or(false)))
    }
}

/// Owns the tenant tree, tenant salts and the users of every tenant
pub struct TenantRegistry {
    state: RwLock<RegistryState>,
    clock: Arc<dyn Clock>,
    max_depth: usize,
}

impl TenantRegistry {
    /// `max_depth` caps every ancestry traversal
    pub fn new(clock: Arc<dyn Clock>, max_depth: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            clock,
            max_depth,
        }
    }

    /// Create a root tenant (no parent) or a sub-tenant
    pub fn create_tenant(&self, name: &str, parent: Option<TenantId>) -> Result<Tenant> {
        if name.trim().is_empty() {
            return Err(AuthzError::InvalidInput("tenant name cannot be empty".to_string()));
        }

        let mut state = self.state.write();

        let tenant_type = match parent {
            Some(parent_id) => {
                let depth = state.walk_up(parent_id, self.max_depth)?.len();
                if depth + 1 > self.max_depth {
                    return Err(AuthzError::HierarchyTooDeep(format!(
                        "sub-tenant of {} would exceed {} levels",
                        parent_id, self.max_depth
                    )));
                }
                TenantType::SubTenant
            }
            None => TenantType::Root,
        };

        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            parent_tenant_id: parent,
            tenant_type,
            is_active: true,
            created_at: self.clock.now(),
            salt: TenantSalt::generate(),
        };

        if let Some(parent_id) = parent {
            state.children.entry(parent_id).or_default().insert(tenant.id);
        }
        state.tenants.insert(tenant.id, tenant.clone());

        info!(tenant_id = %tenant.id, ?tenant_type, "Tenant created");
        Ok(tenant)
    }

    pub fn get_tenant(&self, id: TenantId) -> Result<Tenant> {
        self.state.read().tenant(id).cloned()
    }

    /// Root-to-leaf ordered ancestry of `id`, including `id` itself
    pub fn ancestry_chain(&self, id: TenantId) -> Result<Vec<TenantId>> {
        let mut chain = self.state.read().walk_up(id, self.max_depth)?;
        chain.reverse();
        Ok(chain)
    }

    /// Strict descendant test; a tenant is not its own descendant
    pub fn is_descendant_of(&self, id: TenantId, ancestor: TenantId) -> Result<bool> {
        if id == ancestor {
            return Ok(false);
        }
        let chain = self.state.read().walk_up(id, self.max_depth)?;
        Ok(chain.iter().skip(1).any(|t| *t == ancestor))
    }

    pub fn list_children(&self, id: TenantId) -> Result<Vec<Tenant>> {
        let state = self.state.read();
        state.tenant(id)?;
        Ok(state
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|c| state.tenants.get(c).cloned())
            .collect())
    }

    /// Active only if the tenant and every ancestor are active
    pub fn is_effectively_active(&self, id: TenantId) -> Result<bool> {
        self.state.read().effectively_active(id, self.max_depth)
    }

    pub fn deactivate_tenant(&self, id: TenantId) -> Result<()> {
        self.set_tenant_active(id, false)
    }

    pub fn activate_tenant(&self, id: TenantId) -> Result<()> {
        self.set_tenant_active(id, true)
    }

    fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<()> {
        let mut state = self.state.write();
        let tenant = state
            .tenants
            .get_mut(&id)
            .ok_or_else(|| AuthzError::NotFound(format!("tenant {}", id)))?;
        tenant.is_active = active;
        info!(tenant_id = %id, active, "Tenant activation changed");
        Ok(())
    }

    /// Hard-delete a tenant and, with `cascade`, its whole subtree.
    ///
    /// Returns every removed tenant id so dependent stores can be purged.
    pub fn delete_tenant(&self, id: TenantId, cascade: bool) -> Result<Vec<TenantId>> {
        let mut state = self.state.write();
        let parent = state.tenant(id)?.parent_tenant_id;

        let has_children = state.children.get(&id).map(|c| !c.is_empty()).unwrap_or(false);
        if has_children && !cascade {
            return Err(AuthzError::InvalidInput(format!(
                "tenant {} has sub-tenants; cascade required",
                id
            )));
        }

        let mut removed = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = state.children.remove(&current) {
                queue.extend(children);
            }
            state.tenants.remove(&current);
            removed.push(current);
        }

        let removed_set: HashSet<TenantId> = removed.iter().copied().collect();
        let doomed_users: Vec<UserId> = state
            .users
            .values()
            .filter(|u| removed_set.contains(&u.tenant_id))
            .map(|u| u.id)
            .collect();
        for user_id in &doomed_users {
            state.users.remove(user_id);
            state.superadmins.remove(user_id);
        }
        state.lookup_index.retain(|(tenant, _), _| !removed_set.contains(tenant));

        if let Some(parent_id) = parent {
            if let Some(siblings) = state.children.get_mut(&parent_id) {
                siblings.remove(&id);
            }
        }

        info!(tenant_id = %id, removed = removed.len(), users = doomed_users.len(), "Tenant deleted");
        Ok(removed)
    }

    /// Immutable salt of a tenant
    pub fn tenant_salt(&self, id: TenantId) -> Result<TenantSalt> {
        Ok(self.state.read().tenant(id)?.salt.clone())
    }

    /// Register a user whose PII has already been encrypted
    pub fn register_user(&self, record: UserRecord) -> Result<User> {
        let mut state = self.state.write();
        state.tenant(record.tenant_id)?;

        let lookup_key = (record.tenant_id, record.email_lookup.clone());
        if state.lookup_index.contains_key(&lookup_key) {
            return Err(AuthzError::Duplicate(format!(
                "user with the same email already exists in tenant {}",
                record.tenant_id
            )));
        }

        let user = User {
            id: Uuid::new_v4(),
            tenant_id: record.tenant_id,
            is_active: true,
            is_service_account: record.is_service_account,
            email_encrypted: record.email_encrypted,
            email_lookup: record.email_lookup,
            attributes_encrypted: record.attributes_encrypted,
            created_at: self.clock.now(),
        };

        state.lookup_index.insert(lookup_key, user.id);
        state.users.insert(user.id, user.clone());

        debug!(user_id = %user.id, tenant_id = %user.tenant_id, "User registered");
        Ok(user)
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.state
            .read()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| AuthzError::NotFound(format!("user {}", id)))
    }

    pub fn deactivate_user(&self, id: UserId) -> Result<()> {
        self.set_user_active(id, false)
    }

    pub fn activate_user(&self, id: UserId) -> Result<()> {
        self.set_user_active(id, true)
    }

    fn set_user_active(&self, id: UserId, active: bool) -> Result<()> {
        let mut state = self.state.write();
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| AuthzError::NotFound(format!("user {}", id)))?;
        user.is_active = active;
        debug!(user_id = %id, active, "User activation changed");
        Ok(())
    }

    /// Equality search over an encrypted field via its lookup hash
    pub fn find_by_lookup_hash(&self, tenant_id: TenantId, lookup: &str) -> Option<User> {
        let state = self.state.read();
        state
            .lookup_index
            .get(&(tenant_id, lookup.to_string()))
            .and_then(|id| state.users.get(id))
            .cloned()
    }

    /// Users belonging to exactly `tenant_id`
    pub fn users_in_tenant(&self, tenant_id: TenantId) -> Vec<UserId> {
        self.state
            .read()
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id)
            .map(|u| u.id)
            .collect()
    }

    /// Validate that `user_id` is active and belongs exactly to an active `tenant_id`
    pub fn bind_session(&self, tenant_id: TenantId, user_id: UserId) -> Result<TenantContext> {
        let state = self.state.read();

        let user = state.users.get(&user_id).ok_or_else(|| {
            AuthzError::TenantUserMismatch(format!("user {} is unknown", user_id))
        })?;

        if user.tenant_id != tenant_id || !state.tenants.contains_key(&tenant_id) {
            return Err(AuthzError::TenantUserMismatch(format!(
                "user {} does not belong to tenant {}",
                user_id, tenant_id
            )));
        }

        if !user.is_active {
            return Err(AuthzError::InactiveTenantOrUser(format!("user {} is inactive", user_id)));
        }

        if !state.effectively_active(tenant_id, self.max_depth)? {
            return Err(AuthzError::InactiveTenantOrUser(format!(
                "tenant {} or one of its ancestors is inactive",
                tenant_id
            )));
        }

        Ok(TenantContext::new(tenant_id, user_id, self.clock.now()))
    }

    /// Record an explicit superadmin grant for an existing user
    pub fn grant_superadmin(&self, user_id: UserId, granted_by: UserId, reason: &str) -> Result<SuperadminGrant> {
        if reason.trim().is_empty() {
            return Err(AuthzError::InvalidInput("superadmin grant requires a reason".to_string()));
        }

        let mut state = self.state.write();
        if !state.users.contains_key(&user_id) {
            return Err(AuthzError::NotFound(format!("user {}", user_id)));
        }

        let grant = SuperadminGrant {
            user_id,
            granted_by,
            granted_at: self.clock.now(),
            reason: reason.to_string(),
        };
        state.superadmins.insert(user_id, grant.clone());

        info!(user_id = %user_id, granted_by = %granted_by, "Superadmin granted");
        Ok(grant)
    }

    pub fn revoke_superadmin(&self, user_id: UserId) -> Option<SuperadminGrant> {
        let revoked = self.state.write().superadmins.remove(&user_id);
        if revoked.is_some() {
            info!(user_id = %user_id, "Superadmin revoked");
        }
        revoked
    }

    pub fn superadmin_grant(&self, user_id: UserId) -> Option<SuperadminGrant> {
        self.state.read().superadmins.get(&user_id).cloned()
    }
}
