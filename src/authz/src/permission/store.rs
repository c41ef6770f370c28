//! Permission storage

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{NewPermission, Permission};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::tenant::TenantContext;
use crate::types::{PermissionId, RoleId, TenantId};

/// Permission store trait
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Validate and store a new permission (version 1)
    async fn define_permission(&self, ctx: &TenantContext, new: NewPermission) -> Result<Permission>;

    /// Get any version of a permission in the caller's tenant
    async fn get_permission(&self, ctx: &TenantContext, id: PermissionId) -> Result<Option<Permission>>;

    /// Create a new version of `id` and repoint every role attachment to it
    async fn revise_permission(&self, ctx: &TenantContext, id: PermissionId, new: NewPermission) -> Result<Permission>;

    /// Attach a permission to a role (both in the caller's tenant)
    async fn attach(&self, ctx: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<()>;

    /// Detach; returns whether the edge existed
    async fn detach(&self, ctx: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<bool>;

    /// Current permissions attached to a role
    async fn list_permissions_for_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Vec<Permission>>;

    /// Forget every attachment of a deleted role
    async fn forget_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<()>;

    /// Drop all permissions of a deleted tenant
    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()>;
}

#[derive(Default)]
struct PermissionState {
    permissions: HashMap<PermissionId, Permission>,
    attachments: HashMap<(TenantId, RoleId), BTreeSet<PermissionId>>,
    superseded_by: HashMap<PermissionId, PermissionId>,
}

impl PermissionState {
    fn in_tenant(&self, tenant_id: TenantId, id: PermissionId) -> Result<&Permission> {
        self.permissions
            .get(&id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| AuthzError::NotFound(format!("permission {}", id)))
    }
}

/// In-memory permission store implementation
pub struct InMemoryPermissionStore {
    state: Arc<RwLock<PermissionState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPermissionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PermissionState::default())),
            clock,
        }
    }

    fn build(&self, ctx: &TenantContext, new: NewPermission, version: u32, supersedes: Option<PermissionId>) -> Permission {
        Permission {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            resource_path: new.resource_path,
            actions: new.actions,
            conditions: new.conditions,
            field_permissions: new.field_permissions,
            version,
            supersedes,
            created_at: self.clock.now(),
        }
    }
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn define_permission(&self, ctx: &TenantContext, new: NewPermission) -> Result<Permission> {
        new.validate()?;
        let permission = self.build(ctx, new, 1, None);

        let mut state = self.state.write().await;
        state.permissions.insert(permission.id, permission.clone());

        debug!(permission_id = %permission.id, tenant_id = %permission.tenant_id, "Permission defined");
        Ok(permission)
    }

    async fn get_permission(&self, ctx: &TenantContext, id: PermissionId) -> Result<Option<Permission>> {
        let state = self.state.read().await;
        Ok(state.in_tenant(ctx.tenant_id(), id).ok().cloned())
    }

    async fn revise_permission(&self, ctx: &TenantContext, id: PermissionId, new: NewPermission) -> Result<Permission> {
        new.validate()?;
        let tenant_id = ctx.tenant_id();

        let mut state = self.state.write().await;
        let previous = state.in_tenant(tenant_id, id)?;
        if let Some(newer) = state.superseded_by.get(&id) {
            return Err(AuthzError::InvalidInput(format!(
                "permission {} was already superseded by {}",
                id, newer
            )));
        }

        let revised = self.build(ctx, new, previous.version + 1, Some(id));
        state.permissions.insert(revised.id, revised.clone());
        state.superseded_by.insert(id, revised.id);

        let mut repointed = 0;
        for ((owner, _), attached) in state.attachments.iter_mut() {
            if *owner == tenant_id && attached.remove(&id) {
                attached.insert(revised.id);
                repointed += 1;
            }
        }

        info!(
            permission_id = %id,
            revised_id = %revised.id,
            version = revised.version,
            roles = repointed,
            "Permission revised"
        );
        Ok(revised)
    }

    async fn attach(&self, ctx: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<()> {
        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write().await;
        state.in_tenant(tenant_id, permission_id)?;
        if state.superseded_by.contains_key(&permission_id) {
            return Err(AuthzError::InvalidInput(format!(
                "permission {} is superseded; attach the current version",
                permission_id
            )));
        }

        state
            .attachments
            .entry((tenant_id, role_id))
            .or_default()
            .insert(permission_id);
        Ok(())
    }

    async fn detach(&self, ctx: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .attachments
            .get_mut(&(ctx.tenant_id(), role_id))
            .map(|attached| attached.remove(&permission_id))
            .unwrap_or(false))
    }

    async fn list_permissions_for_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Vec<Permission>> {
        let tenant_id = ctx.tenant_id();
        let state = self.state.read().await;

        let Some(attached) = state.attachments.get(&(tenant_id, role_id)) else {
            return Ok(Vec::new());
        };

        attached
            .iter()
            .map(|id| {
                state.in_tenant(tenant_id, *id).cloned().map_err(|_| {
                    AuthzError::ResolutionFailure(format!(
                        "role {} references permission {} outside its tenant",
                        role_id, id
                    ))
                })
            })
            .collect()
    }

    async fn forget_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<()> {
        self.state
            .write()
            .await
            .attachments
            .remove(&(ctx.tenant_id(), role_id));
        Ok(())
    }

    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        let mut state = self.state.write().await;
        let doomed: BTreeSet<PermissionId> = state
            .permissions
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .map(|p| p.id)
            .collect();

        state.permissions.retain(|id, _| !doomed.contains(id));
        state.superseded_by.retain(|id, _| !doomed.contains(id));
        state.attachments.retain(|(owner, _), _| *owner != tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{Action, FieldVisibility, ResourceType};
    use chrono::Utc;

    fn ctx() -> TenantContext {
        TenantContext::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    fn store() -> InMemoryPermissionStore {
        InMemoryPermissionStore::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_define_rejects_malformed() {
        let store = store();
        let result = store
            .define_permission(&ctx(), NewPermission::general(ResourceType::Entity, Vec::<Action>::new()))
            .await;
        assert!(matches!(result, Err(AuthzError::MalformedPermission(_))));
    }

    #[tokio::test]
    async fn test_attach_and_list() {
        let store = store();
        let t = ctx();
        let role = Uuid::new_v4();

        let perm = store
            .define_permission(&t, NewPermission::general(ResourceType::Entity, [Action::Read]))
            .await
            .unwrap();
        store.attach(&t, role, perm.id).await.unwrap();

        let listed = store.list_permissions_for_role(&t, role).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, perm.id);

        assert!(store.detach(&t, role, perm.id).await.unwrap());
        assert!(store.list_permissions_for_role(&t, role).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_tenant_attach_rejected() {
        let store = store();
        let (t1, t2) = (ctx(), ctx());
        let perm = store
            .define_permission(&t1, NewPermission::general(ResourceType::Entity, [Action::Read]))
            .await
            .unwrap();

        assert!(matches!(
            store.attach(&t2, Uuid::new_v4(), perm.id).await,
            Err(AuthzError::NotFound(_))
        ));
        assert!(store.get_permission(&t2, perm.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revision_repoints_roles() {
        let store = store();
        let t = ctx();
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());

        let v1 = store
            .define_permission(&t, NewPermission::general(ResourceType::Entity, [Action::Read]))
            .await
            .unwrap();
        store.attach(&t, r1, v1.id).await.unwrap();
        store.attach(&t, r2, v1.id).await.unwrap();

        let v2 = store
            .revise_permission(
                &t,
                v1.id,
                NewPermission::general(ResourceType::Entity, [Action::Read])
                    .with_field("salary", FieldVisibility::Masked),
            )
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.supersedes, Some(v1.id));

        for role in [r1, r2] {
            let listed = store.list_permissions_for_role(&t, role).await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].id, v2.id);
        }

        // Old version stays readable but cannot be revised or attached again
        assert!(store.get_permission(&t, v1.id).await.unwrap().is_some());
        assert!(store
            .revise_permission(&t, v1.id, NewPermission::general(ResourceType::Entity, [Action::Read]))
            .await
            .is_err());
        assert!(store.attach(&t, r1, v1.id).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_tenant() {
        let store = store();
        let t = ctx();
        let role = Uuid::new_v4();
        let perm = store
            .define_permission(&t, NewPermission::general(ResourceType::Api, [Action::Execute]))
            .await
            .unwrap();
        store.attach(&t, role, perm.id).await.unwrap();

        store.purge_tenant(t.tenant_id()).await.unwrap();
        assert!(store.get_permission(&t, perm.id).await.unwrap().is_none());
        assert!(store.list_permissions_for_role(&t, role).await.unwrap().is_empty());
    }
}
