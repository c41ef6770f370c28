//! Administrative mutations and queries
//!
//! Each mutation commits, invalidates the cache entries it can affect and
//! records an audit event. Superadmin grants are audited before they commit.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use tracing::info;

use super::{risk, AuthzEngine};
use crate::error::{AuthzError, Result};
use crate::groups::{Group, GroupRole, UserGroup};
use crate::permission::{NewPermission, Permission};
use crate::resource::{NewResource, Resource};
use crate::roles::{NewRole, Role, UserRole};
use crate::tenant::{SuperadminGrant, Tenant, TenantContext, User, UserRecord};
use crate::types::{GroupId, PermissionId, ResourceId, ResourceType, RoleId, TenantId, UserId};

/// Field name under which email lookup hashes are keyed
const EMAIL_FIELD: &str = "email";

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl AuthzEngine {
    // Tenants

    /// Create a root tenant (`parent = None`) or a sub-tenant
    pub async fn create_tenant(&self, name: &str, parent: Option<TenantId>) -> Result<Tenant> {
        let outcome = self.registry.create_tenant(name, parent);
        let mut event = self.event("tenant.create", None);
        if let Ok(tenant) = &outcome {
            event = event.tenant(tenant.id).resource(format!("tenant:{}", tenant.id));
        }
        self.audited(event.details(json!({ "name": name, "parent": parent })), outcome)
            .await
    }

    pub fn get_tenant(&self, tenant_id: TenantId) -> Result<Tenant> {
        self.registry.get_tenant(tenant_id)
    }

    /// Root-first chain of tenant ids ending at `tenant_id`
    pub fn tenant_ancestry(&self, tenant_id: TenantId) -> Result<Vec<TenantId>> {
        self.registry.ancestry_chain(tenant_id)
    }

    pub fn list_child_tenants(&self, tenant_id: TenantId) -> Result<Vec<Tenant>> {
        self.registry.list_children(tenant_id)
    }

    pub fn is_descendant_tenant(&self, tenant_id: TenantId, ancestor: TenantId) -> Result<bool> {
        self.registry.is_descendant_of(tenant_id, ancestor)
    }

    /// Soft-deactivate a tenant; sessions in it and every sub-tenant are refused
    pub async fn deactivate_tenant(&self, actor: Option<UserId>, tenant_id: TenantId) -> Result<()> {
        self.set_tenant_active(actor, tenant_id, false).await
    }

    pub async fn activate_tenant(&self, actor: Option<UserId>, tenant_id: TenantId) -> Result<()> {
        self.set_tenant_active(actor, tenant_id, true).await
    }

    async fn set_tenant_active(&self, actor: Option<UserId>, tenant_id: TenantId, active: bool) -> Result<()> {
        let outcome = if active {
            self.registry.activate_tenant(tenant_id)
        } else {
            self.registry.deactivate_tenant(tenant_id)
        };

        if outcome.is_ok() {
            for affected in self.tenant_subtree(tenant_id)? {
                self.cache.invalidate_tenant(affected);
            }
        }

        let action = if active { "tenant.activate" } else { "tenant.deactivate" };
        let mut event = self
            .event(action, None)
            .tenant(tenant_id)
            .resource(format!("tenant:{}", tenant_id))
            .risk(risk::DESTRUCTIVE);
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        self.audited(event, outcome).await
    }

    /// Hard-delete a tenant (and, with `cascade`, its sub-tenants) from every store
    pub async fn delete_tenant(&self, actor: Option<UserId>, tenant_id: TenantId, cascade: bool) -> Result<Vec<TenantId>> {
        let outcome = match self.registry.delete_tenant(tenant_id, cascade) {
            Ok(removed) => self.purge_tenants(&removed).await.map(|_| removed),
            Err(e) => Err(e),
        };

        let mut event = self
            .event("tenant.delete", None)
            .tenant(tenant_id)
            .resource(format!("tenant:{}", tenant_id))
            .risk(risk::DESTRUCTIVE)
            .details(json!({ "cascade": cascade }));
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        self.audited(event, outcome).await
    }

    async fn purge_tenants(&self, removed: &[TenantId]) -> Result<()> {
        for id in removed {
            self.catalog.purge_tenant(*id);
            self.roles.purge_tenant(*id);
            self.groups.purge_tenant(*id);
            self.cache.invalidate_tenant(*id);
            self.permissions.purge_tenant(*id).await?;
        }
        Ok(())
    }

    fn tenant_subtree(&self, tenant_id: TenantId) -> Result<Vec<TenantId>> {
        let mut all = Vec::new();
        let mut queue = VecDeque::from([tenant_id]);
        while let Some(current) = queue.pop_front() {
            queue.extend(self.registry.list_children(current)?.into_iter().map(|t| t.id));
            all.push(current);
        }
        Ok(all)
    }

    // Users

    /// Register a user; the email is stored encrypted alongside a lookup hash
    pub async fn register_user(
        &self,
        tenant_id: TenantId,
        email: &str,
        is_service_account: bool,
        attributes: Option<&serde_json::Value>,
    ) -> Result<User> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AuthzError::InvalidInput("email cannot be empty".to_string()));
        }

        let attributes_encrypted = match attributes {
            Some(attrs) => Some(self.vault.encrypt(&attrs.to_string())?),
            None => None,
        };

        let outcome = self.registry.register_user(UserRecord {
            tenant_id,
            is_service_account,
            email_encrypted: self.vault.encrypt(&email)?,
            email_lookup: self.vault.lookup_hash(EMAIL_FIELD, &email),
            attributes_encrypted,
        });

        let mut event = self.event("user.register", None).tenant(tenant_id);
        if let Ok(user) = &outcome {
            event = event.resource(format!("user:{}", user.id));
        }
        self.audited(event, outcome).await
    }

    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.registry.get_user(user_id)
    }

    /// Equality search on the encrypted email through its lookup hash
    pub fn find_user_by_email(&self, tenant_id: TenantId, email: &str) -> Option<User> {
        let lookup = self.vault.lookup_hash(EMAIL_FIELD, &normalize_email(email));
        self.registry.find_by_lookup_hash(tenant_id, &lookup)
    }

    pub fn user_email(&self, user_id: UserId) -> Result<String> {
        let user = self.registry.get_user(user_id)?;
        self.decrypt_field(&user.email_encrypted)
    }

    pub fn user_attributes(&self, user_id: UserId) -> Result<Option<serde_json::Value>> {
        let user = self.registry.get_user(user_id)?;
        match user.attributes_encrypted {
            Some(ciphertext) => {
                let plaintext = self.decrypt_field(&ciphertext)?;
                serde_json::from_str(&plaintext)
                    .map(Some)
                    .map_err(|e| AuthzError::Internal(format!("corrupt user attributes: {}", e)))
            }
            None => Ok(None),
        }
    }

    pub async fn deactivate_user(&self, actor: &TenantContext, user_id: UserId) -> Result<()> {
        let outcome = self
            .require_member(actor, user_id)
            .and_then(|_| self.registry.deactivate_user(user_id));
        if outcome.is_ok() {
            self.cache.invalidate_user(user_id);
        }
        let event = self
            .event("user.deactivate", Some(actor))
            .resource(format!("user:{}", user_id))
            .risk(risk::DESTRUCTIVE);
        self.audited(event, outcome).await
    }

    pub async fn activate_user(&self, actor: &TenantContext, user_id: UserId) -> Result<()> {
        let outcome = self
            .require_member(actor, user_id)
            .and_then(|_| self.registry.activate_user(user_id));
        if outcome.is_ok() {
            self.cache.invalidate_user(user_id);
        }
        let event = self
            .event("user.activate", Some(actor))
            .resource(format!("user:{}", user_id));
        self.audited(event, outcome).await
    }

    fn require_member(&self, ctx: &TenantContext, user_id: UserId) -> Result<User> {
        let user = self.registry.get_user(user_id)?;
        if user.tenant_id != ctx.tenant_id() {
            return Err(AuthzError::TenantUserMismatch(format!(
                "user {} does not belong to tenant {}",
                user_id,
                ctx.tenant_id()
            )));
        }
        Ok(user)
    }

    // Superadmin

    /// Grant platform superadmin. The grant is audited (acknowledged) before it commits.
    pub async fn grant_superadmin(&self, granted_by: UserId, user_id: UserId, reason: &str) -> Result<SuperadminGrant> {
        if reason.trim().is_empty() {
            return Err(AuthzError::InvalidInput("superadmin grant requires a reason".to_string()));
        }
        let user = self.registry.get_user(user_id)?;

        let event = self
            .event("superadmin.grant", None)
            .tenant(user.tenant_id)
            .actor(granted_by)
            .resource(format!("user:{}", user_id))
            .risk(risk::ELEVATION)
            .details(json!({ "reason": reason }));
        self.audit.record(event).await?;

        let grant = self.registry.grant_superadmin(user_id, granted_by, reason)?;
        self.cache.invalidate_user(user_id);
        info!(target: "security", user_id = %user_id, granted_by = %granted_by, "Superadmin granted");
        Ok(grant)
    }

    pub async fn revoke_superadmin(&self, revoked_by: UserId, user_id: UserId) -> Result<Option<SuperadminGrant>> {
        let revoked = self.registry.revoke_superadmin(user_id);
        self.cache.invalidate_user(user_id);

        let mut event = self
            .event("superadmin.revoke", None)
            .actor(revoked_by)
            .resource(format!("user:{}", user_id))
            .risk(risk::ELEVATION)
            .details(json!({ "was_superadmin": revoked.is_some() }));
        if let Ok(user) = self.registry.get_user(user_id) {
            event = event.tenant(user.tenant_id);
        }
        self.audited(event, Ok(revoked)).await
    }

    pub fn superadmin_grant(&self, user_id: UserId) -> Option<SuperadminGrant> {
        self.registry.superadmin_grant(user_id)
    }

    // Resources

    pub async fn create_resource(&self, actor: &TenantContext, new: NewResource) -> Result<Resource> {
        let outcome = self.catalog.create_resource(actor, new);
        if outcome.is_ok() {
            // Path-scoped permissions may now expand to the new resource
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let mut event = self.event("resource.create", Some(actor));
        if let Ok(resource) = &outcome {
            event = event.resource(format!("{}:{}", resource.resource_type, resource.id));
        }
        self.audited(event, outcome).await
    }

    pub async fn move_resource(
        &self,
        actor: &TenantContext,
        resource_id: ResourceId,
        new_parent: Option<ResourceId>,
    ) -> Result<Resource> {
        let outcome = self.catalog.move_resource(actor, resource_id, new_parent);
        if outcome.is_ok() {
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let event = self
            .event("resource.move", Some(actor))
            .resource(format!("resource:{}", resource_id))
            .details(json!({ "new_parent": new_parent }));
        self.audited(event, outcome).await
    }

    pub fn get_resource(&self, ctx: &TenantContext, resource_id: ResourceId) -> Result<Resource> {
        self.catalog.get(ctx, resource_id)
    }

    pub fn find_resource_by_path(&self, ctx: &TenantContext, path: &str) -> Option<Resource> {
        self.catalog.find_by_path(ctx, path)
    }

    pub fn child_resources(&self, ctx: &TenantContext, resource_id: ResourceId) -> Result<Vec<Resource>> {
        self.catalog.children(ctx, resource_id)
    }

    pub fn resources_under_path(
        &self,
        ctx: &TenantContext,
        prefix: &str,
        resource_type: Option<ResourceType>,
    ) -> Vec<Resource> {
        self.catalog.resources_under_path(ctx, prefix, resource_type)
    }

    // Roles

    pub async fn create_role(&self, actor: &TenantContext, new: NewRole) -> Result<Role> {
        let outcome = self.roles.create_role(actor, new);
        if let Ok(role) = &outcome {
            if role.parent_role_id.is_some() {
                self.cache.invalidate_tenant(actor.tenant_id());
            }
        }
        let mut event = self.event("role.create", Some(actor));
        if let Ok(role) = &outcome {
            event = event.resource(format!("role:{}", role.id));
        }
        self.audited(event, outcome).await
    }

    /// Re-parent a role; rejected with `CircularInheritance`, `HierarchyTooDeep`
    /// or `CrossTenantParent` when the graph would become invalid
    pub async fn set_role_parent(&self, actor: &TenantContext, role_id: RoleId, parent: Option<RoleId>) -> Result<Role> {
        let outcome = self.roles.set_parent(actor, role_id, parent);
        if outcome.is_ok() {
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let event = self
            .event("role.set_parent", Some(actor))
            .resource(format!("role:{}", role_id))
            .details(json!({ "parent": parent }));
        self.audited(event, outcome).await
    }

    pub async fn delete_role(&self, actor: &TenantContext, role_id: RoleId) -> Result<Role> {
        let outcome = match self.roles.delete_role(actor, role_id) {
            Ok(role) => {
                self.groups.forget_role(actor, role_id);
                self.cache.invalidate_tenant(actor.tenant_id());
                self.permissions.forget_role(actor, role_id).await.map(|_| role)
            }
            Err(e) => Err(e),
        };
        let event = self
            .event("role.delete", Some(actor))
            .resource(format!("role:{}", role_id))
            .risk(risk::DESTRUCTIVE);
        self.audited(event, outcome).await
    }

    pub fn get_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Role> {
        self.roles.get_role(ctx, role_id)
    }

    pub fn find_role(&self, ctx: &TenantContext, name: &str) -> Option<Role> {
        self.roles.find_by_name(ctx, name)
    }

    pub fn list_roles(&self, ctx: &TenantContext) -> Vec<Role> {
        self.roles.list_roles(ctx)
    }

    /// `role_id` followed by its ancestors
    pub fn role_chain(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Vec<RoleId>> {
        self.roles.resolve_inherited_chain(ctx, role_id)
    }

    pub async fn assign_role(
        &self,
        actor: &TenantContext,
        user_id: UserId,
        role_id: RoleId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRole> {
        let outcome = self
            .require_member(actor, user_id)
            .and_then(|_| self.roles.assign_role(actor, user_id, role_id, expires_at));
        if outcome.is_ok() {
            self.cache.invalidate_user(user_id);
        }
        let event = self
            .event("role.assign", Some(actor))
            .resource(format!("role:{}", role_id))
            .details(json!({ "user_id": user_id, "expires_at": expires_at }));
        self.audited(event, outcome).await
    }

    pub async fn revoke_role(&self, actor: &TenantContext, user_id: UserId, role_id: RoleId) -> Result<bool> {
        let revoked = self.roles.revoke_role(actor, user_id, role_id);
        self.cache.invalidate_user(user_id);
        let event = self
            .event("role.revoke", Some(actor))
            .resource(format!("role:{}", role_id))
            .details(json!({ "user_id": user_id, "existed": revoked }));
        self.audited(event, Ok(revoked)).await
    }

    // Groups

    pub async fn create_group(&self, actor: &TenantContext, name: &str, parent: Option<GroupId>) -> Result<Group> {
        let outcome = self.groups.create_group(actor, name, parent);
        let mut event = self.event("group.create", Some(actor));
        if let Ok(group) = &outcome {
            event = event.resource(format!("group:{}", group.id));
        }
        self.audited(event, outcome).await
    }

    pub async fn set_group_parent(&self, actor: &TenantContext, group_id: GroupId, parent: Option<GroupId>) -> Result<Group> {
        let outcome = self.groups.set_parent(actor, group_id, parent);
        if outcome.is_ok() {
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let event = self
            .event("group.set_parent", Some(actor))
            .resource(format!("group:{}", group_id))
            .details(json!({ "parent": parent }));
        self.audited(event, outcome).await
    }

    pub fn get_group(&self, ctx: &TenantContext, group_id: GroupId) -> Result<Group> {
        self.groups.get_group(ctx, group_id)
    }

    pub async fn add_group_member(
        &self,
        actor: &TenantContext,
        group_id: GroupId,
        user_id: UserId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserGroup> {
        let outcome = self
            .require_member(actor, user_id)
            .and_then(|_| self.groups.add_member(actor, group_id, user_id, expires_at));
        if outcome.is_ok() {
            self.cache.invalidate_user(user_id);
        }
        let event = self
            .event("group.add_member", Some(actor))
            .resource(format!("group:{}", group_id))
            .details(json!({ "user_id": user_id, "expires_at": expires_at }));
        self.audited(event, outcome).await
    }

    pub async fn remove_group_member(&self, actor: &TenantContext, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let removed = self.groups.remove_member(actor, group_id, user_id);
        self.cache.invalidate_user(user_id);
        let event = self
            .event("group.remove_member", Some(actor))
            .resource(format!("group:{}", group_id))
            .details(json!({ "user_id": user_id, "existed": removed }));
        self.audited(event, Ok(removed)).await
    }

    pub async fn grant_group_role(
        &self,
        actor: &TenantContext,
        group_id: GroupId,
        role_id: RoleId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GroupRole> {
        let outcome = self
            .roles
            .get_role(actor, role_id)
            .and_then(|_| self.groups.grant_role(actor, group_id, role_id, expires_at));
        if outcome.is_ok() {
            self.invalidate_members(actor, group_id);
        }
        let event = self
            .event("group.grant_role", Some(actor))
            .resource(format!("group:{}", group_id))
            .details(json!({ "role_id": role_id, "expires_at": expires_at }));
        self.audited(event, outcome).await
    }

    pub async fn revoke_group_role(&self, actor: &TenantContext, group_id: GroupId, role_id: RoleId) -> Result<bool> {
        let revoked = self.groups.revoke_role(actor, group_id, role_id);
        self.invalidate_members(actor, group_id);

        let event = self
            .event("group.revoke_role", Some(actor))
            .resource(format!("group:{}", group_id))
            .details(json!({ "role_id": role_id, "existed": revoked }));
        self.audited(event, Ok(revoked)).await
    }

    fn invalidate_members(&self, ctx: &TenantContext, group_id: GroupId) {
        for user_id in self.groups.affected_members(ctx, group_id) {
            self.cache.invalidate_user(user_id);
        }
    }

    // Permissions

    pub async fn define_permission(&self, actor: &TenantContext, new: NewPermission) -> Result<Permission> {
        let outcome = self.permissions.define_permission(actor, new).await;
        let mut event = self.event("permission.define", Some(actor));
        if let Ok(permission) = &outcome {
            event = event.resource(format!("permission:{}", permission.id));
        }
        self.audited(event, outcome).await
    }

    /// Publish a new version of a permission; every role holding it moves to the new version
    pub async fn revise_permission(
        &self,
        actor: &TenantContext,
        permission_id: PermissionId,
        new: NewPermission,
    ) -> Result<Permission> {
        let outcome = self.permissions.revise_permission(actor, permission_id, new).await;
        if outcome.is_ok() {
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let mut event = self
            .event("permission.revise", Some(actor))
            .resource(format!("permission:{}", permission_id));
        if let Ok(revised) = &outcome {
            event = event.details(json!({ "new_id": revised.id, "version": revised.version }));
        }
        self.audited(event, outcome).await
    }

    pub async fn get_permission(&self, ctx: &TenantContext, permission_id: PermissionId) -> Result<Option<Permission>> {
        self.permissions.get_permission(ctx, permission_id).await
    }

    pub async fn attach_permission(&self, actor: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<()> {
        let outcome = match self.roles.get_role(actor, role_id) {
            Ok(_) => self.permissions.attach(actor, role_id, permission_id).await,
            Err(e) => Err(e),
        };
        if outcome.is_ok() {
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let event = self
            .event("permission.attach", Some(actor))
            .resource(format!("role:{}", role_id))
            .details(json!({ "permission_id": permission_id }));
        self.audited(event, outcome).await
    }

    pub async fn detach_permission(&self, actor: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<bool> {
        let outcome = self.permissions.detach(actor, role_id, permission_id).await;
        if outcome.is_ok() {
            self.cache.invalidate_tenant(actor.tenant_id());
        }
        let event = self
            .event("permission.detach", Some(actor))
            .resource(format!("role:{}", role_id))
            .details(json!({ "permission_id": permission_id }));
        self.audited(event, outcome).await
    }

    pub async fn role_permissions(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Vec<Permission>> {
        self.permissions.list_permissions_for_role(ctx, role_id).await
    }
}
