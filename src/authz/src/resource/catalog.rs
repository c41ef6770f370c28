//! Hierarchical resource catalog with materialized paths

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{child_path, path_hash, NewResource, Resource};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::tenant::TenantContext;
use crate::types::{ResourceId, ResourceType, TenantId};

#[derive(Default)]
struct TenantResources {
    nodes: HashMap<ResourceId, Resource>,
    children: HashMap<ResourceId, HashSet<ResourceId>>,
    /// path_hash -> ids; more than one id only on a digest collision
    by_hash: HashMap<String, Vec<ResourceId>>,
}

impl TenantResources {
    fn index(&mut self, resource: &Resource) {
        self.by_hash
            .entry(resource.path_hash.clone())
            .or_default()
            .push(resource.id);
    }

    fn unindex(&mut self, hash: &str, id: ResourceId) {
        if let Some(ids) = self.by_hash.get_mut(hash) {
            ids.retain(|r| *r != id);
            if ids.is_empty() {
                self.by_hash.remove(hash);
            }
        }
    }

    fn subtree(&self, root: ResourceId) -> Vec<ResourceId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            out.push(current);
            if let Some(children) = self.children.get(&current) {
                queue.extend(children.iter().copied());
            }
        }
        out
    }
}

#[derive(Default)]
struct CatalogState {
    tenants: HashMap<TenantId, TenantResources>,
    owners: HashMap<ResourceId, TenantId>,
}

impl CatalogState {
    /// Parent lookup that distinguishes "elsewhere" from "nowhere"
    fn parent_in_tenant(&self, tenant_id: TenantId, parent_id: ResourceId) -> Result<&Resource> {
        match self.owners.get(&parent_id) {
            None => Err(AuthzError::NotFound(format!("resource {}", parent_id))),
            Some(owner) if *owner != tenant_id => Err(AuthzError::CrossTenantParent(format!(
                "parent {} belongs to another tenant",
                parent_id
            ))),
            Some(_) => self
                .tenants
                .get(&tenant_id)
                .and_then(|t| t.nodes.get(&parent_id))
                .ok_or_else(|| AuthzError::NotFound(format!("resource {}", parent_id))),
        }
    }
}

fn check_nesting(parent: &Resource, child: ResourceType) -> Result<()> {
    if parent.resource_type.can_contain(child) {
        Ok(())
    } else {
        Err(AuthzError::InvalidInput(format!(
            "{} cannot contain {}",
            parent.resource_type, child
        )))
    }
}

/// Owns every tenant's resource tree
pub struct ResourceCatalog {
    state: RwLock<CatalogState>,
    clock: Arc<dyn Clock>,
}

impl ResourceCatalog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            clock,
        }
    }

    /// Create a resource under an optional same-tenant parent
    pub fn create_resource(&self, ctx: &TenantContext, new: NewResource) -> Result<Resource> {
        if new.name.trim().is_empty() {
            return Err(AuthzError::InvalidInput("resource name cannot be empty".to_string()));
        }

        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();

        let parent_path = match new.parent_id {
            Some(parent_id) => {
                let parent = state.parent_in_tenant(tenant_id, parent_id)?;
                check_nesting(parent, new.resource_type)?;
                Some(parent.path.clone())
            }
            None => None,
        };

        let id = Uuid::new_v4();
        let path = child_path(parent_path.as_deref(), id);
        let resource = Resource {
            id,
            tenant_id,
            resource_type: new.resource_type,
            name: new.name,
            parent_id: new.parent_id,
            path_hash: path_hash(&path),
            path,
            created_at: self.clock.now(),
        };

        let tenant = state.tenants.entry(tenant_id).or_default();
        if let Some(parent_id) = resource.parent_id {
            tenant.children.entry(parent_id).or_default().insert(id);
        }
        tenant.index(&resource);
        tenant.nodes.insert(id, resource.clone());
        state.owners.insert(id, tenant_id);

        debug!(resource_id = %id, tenant_id = %tenant_id, path = %resource.path, "Resource created");
        Ok(resource)
    }

    /// Re-parent a subtree, recomputing every path and path hash in one write
    pub fn move_resource(
        &self,
        ctx: &TenantContext,
        id: ResourceId,
        new_parent: Option<ResourceId>,
    ) -> Result<Resource> {
        let tenant_id = ctx.tenant_id();
        let mut state = self.state.write();

        let node = state
            .tenants
            .get(&tenant_id)
            .and_then(|t| t.nodes.get(&id))
            .cloned()
            .ok_or_else(|| AuthzError::NotFound(format!("resource {}", id)))?;

        let new_root_path = match new_parent {
            Some(parent_id) => {
                let parent = state.parent_in_tenant(tenant_id, parent_id)?;
                if parent_id == id || parent.is_under(&node.path) {
                    return Err(AuthzError::CircularInheritance(format!(
                        "cannot move {} under its own descendant {}",
                        id, parent_id
                    )));
                }
                check_nesting(parent, node.resource_type)?;
                child_path(Some(&parent.path), id)
            }
            None => child_path(None, id),
        };

        let tenant = state
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| AuthzError::Internal(format!("tenant {} catalog vanished", tenant_id)))?;

        // Compute every new path before touching the tree
        let old_root_path = node.path.clone();
        let updates: Vec<(ResourceId, String, String)> = tenant
            .subtree(id)
            .into_iter()
            .filter_map(|rid| tenant.nodes.get(&rid))
            .map(|r| {
                let suffix = &r.path[old_root_path.len()..];
                let path = format!("{}{}", new_root_path, suffix);
                (r.id, r.path_hash.clone(), path)
            })
            .collect();

        for (rid, old_hash, path) in &updates {
            tenant.unindex(old_hash, *rid);
            if let Some(r) = tenant.nodes.get_mut(rid) {
                r.path_hash = path_hash(path);
                r.path = path.clone();
            }
        }
        for (rid, _, _) in &updates {
            if let Some(r) = tenant.nodes.get(rid).cloned() {
                tenant.index(&r);
            }
        }

        if let Some(old_parent) = node.parent_id {
            if let Some(siblings) = tenant.children.get_mut(&old_parent) {
                siblings.remove(&id);
            }
        }
        if let Some(parent_id) = new_parent {
            tenant.children.entry(parent_id).or_default().insert(id);
        }

        let moved = tenant
            .nodes
            .get_mut(&id)
            .ok_or_else(|| AuthzError::Internal(format!("resource {} vanished during move", id)))?;
        moved.parent_id = new_parent;

        info!(resource_id = %id, subtree = updates.len(), "Resource moved");
        Ok(moved.clone())
    }

    /// Lookup by materialized path; the hash narrows, the exact path decides
    pub fn find_by_path(&self, ctx: &TenantContext, path: &str) -> Option<Resource> {
        let state = self.state.read();
        let tenant = state.tenants.get(&ctx.tenant_id())?;
        tenant
            .by_hash
            .get(&path_hash(path))?
            .iter()
            .filter_map(|id| tenant.nodes.get(id))
            .find(|r| r.path == path)
            .cloned()
    }

    pub fn get(&self, ctx: &TenantContext, id: ResourceId) -> Result<Resource> {
        self.state
            .read()
            .tenants
            .get(&ctx.tenant_id())
            .and_then(|t| t.nodes.get(&id))
            .cloned()
            .ok_or_else(|| AuthzError::NotFound(format!("resource {}", id)))
    }

    /// Whether `id` exists in the caller's tenant
    pub fn contains(&self, ctx: &TenantContext, id: ResourceId) -> bool {
        self.state
            .read()
            .tenants
            .get(&ctx.tenant_id())
            .map(|t| t.nodes.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn children(&self, ctx: &TenantContext, id: ResourceId) -> Result<Vec<Resource>> {
        let state = self.state.read();
        let tenant = state
            .tenants
            .get(&ctx.tenant_id())
            .filter(|t| t.nodes.contains_key(&id))
            .ok_or_else(|| AuthzError::NotFound(format!("resource {}", id)))?;

        Ok(tenant
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|c| tenant.nodes.get(c).cloned())
            .collect())
    }

    /// Resources whose path starts with `prefix`, optionally of one type
    pub fn resources_under_path(
        &self,
        ctx: &TenantContext,
        prefix: &str,
        resource_type: Option<ResourceType>,
    ) -> Vec<Resource> {
        let state = self.state.read();
        let Some(tenant) = state.tenants.get(&ctx.tenant_id()) else {
            return Vec::new();
        };

        let mut found: Vec<Resource> = tenant
            .nodes
            .values()
            .filter(|r| r.is_under(prefix))
            .filter(|r| resource_type.map_or(true, |t| r.resource_type == t))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }

    /// Drop every resource of a deleted tenant
    pub fn purge_tenant(&self, tenant_id: TenantId) {
        let mut state = self.state.write();
        if let Some(removed) = state.tenants.remove(&tenant_id) {
            for id in removed.nodes.keys() {
                state.owners.remove(id);
            }
            debug!(tenant_id = %tenant_id, count = removed.nodes.len(), "Tenant resources purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use chrono::Utc;

    fn ctx(tenant_id: TenantId) -> TenantContext {
        TenantContext::new(tenant_id, Uuid::new_v4(), Utc::now())
    }

    fn catalog() -> ResourceCatalog {
        ResourceCatalog::new(Arc::new(SystemClock))
    }

    #[test]
    fn test_paths_follow_parents() {
        let cat = catalog();
        let t = ctx(Uuid::new_v4());

        let family = cat.create_resource(&t, NewResource::root(ResourceType::ProductFamily, "hr")).unwrap();
        let app = cat
            .create_resource(&t, NewResource::child(ResourceType::App, "payroll", family.id))
            .unwrap();

        assert_eq!(family.path, format!("/{}/", family.id));
        assert_eq!(app.path, format!("/{}/{}/", family.id, app.id));
        assert_eq!(app.path_hash, path_hash(&app.path));
        assert_eq!(cat.find_by_path(&t, &app.path).unwrap().id, app.id);
        assert!(cat.find_by_path(&t, "/nope/").is_none());
    }

    #[test]
    fn test_cross_tenant_parent_rejected() {
        let cat = catalog();
        let t1 = ctx(Uuid::new_v4());
        let t2 = ctx(Uuid::new_v4());

        let family = cat.create_resource(&t1, NewResource::root(ResourceType::ProductFamily, "hr")).unwrap();
        let result = cat.create_resource(&t2, NewResource::child(ResourceType::App, "x", family.id));
        assert!(matches!(result, Err(AuthzError::CrossTenantParent(_))));

        // Tenant isolation on reads
        assert!(cat.get(&t2, family.id).is_err());
        assert!(!cat.contains(&t2, family.id));
        assert!(cat.find_by_path(&t2, &family.path).is_none());
    }

    #[test]
    fn test_nesting_rule() {
        let cat = catalog();
        let t = ctx(Uuid::new_v4());
        let entity = cat.create_resource(&t, NewResource::root(ResourceType::Entity, "invoice")).unwrap();
        let result = cat.create_resource(&t, NewResource::child(ResourceType::Page, "p", entity.id));
        assert!(matches!(result, Err(AuthzError::InvalidInput(_))));
    }

    #[test]
    fn test_move_recomputes_subtree() {
        let cat = catalog();
        let t = ctx(Uuid::new_v4());

        let fam_a = cat.create_resource(&t, NewResource::root(ResourceType::ProductFamily, "a")).unwrap();
        let fam_b = cat.create_resource(&t, NewResource::root(ResourceType::ProductFamily, "b")).unwrap();
        let app = cat.create_resource(&t, NewResource::child(ResourceType::App, "app", fam_a.id)).unwrap();
        let entity = cat
            .create_resource(&t, NewResource::child(ResourceType::Entity, "e", app.id))
            .unwrap();
        let old_entity_path = entity.path.clone();

        let moved = cat.move_resource(&t, app.id, Some(fam_b.id)).unwrap();
        assert_eq!(moved.parent_id, Some(fam_b.id));
        assert_eq!(moved.path, format!("/{}/{}/", fam_b.id, app.id));

        let entity = cat.get(&t, entity.id).unwrap();
        assert_eq!(entity.path, format!("/{}/{}/{}/", fam_b.id, app.id, entity.id));
        assert_eq!(entity.path_hash, path_hash(&entity.path));
        assert!(cat.find_by_path(&t, &old_entity_path).is_none());
        assert_eq!(cat.find_by_path(&t, &entity.path).unwrap().id, entity.id);

        assert!(cat.children(&t, fam_a.id).unwrap().is_empty());
        assert_eq!(cat.children(&t, fam_b.id).unwrap().len(), 1);
    }

    #[test]
    fn test_move_under_descendant_rejected() {
        let cat = catalog();
        let t = ctx(Uuid::new_v4());
        let app = cat.create_resource(&t, NewResource::root(ResourceType::App, "app")).unwrap();
        let cap = cat
            .create_resource(&t, NewResource::child(ResourceType::Capability, "cap", app.id))
            .unwrap();

        assert!(matches!(
            cat.move_resource(&t, app.id, Some(cap.id)),
            Err(AuthzError::CircularInheritance(_))
        ));
        assert!(matches!(
            cat.move_resource(&t, app.id, Some(app.id)),
            Err(AuthzError::CircularInheritance(_))
        ));
    }

    #[test]
    fn test_move_into_other_tenant_rejected() {
        let cat = catalog();
        let t1 = ctx(Uuid::new_v4());
        let t2 = ctx(Uuid::new_v4());
        let app = cat.create_resource(&t1, NewResource::root(ResourceType::App, "app")).unwrap();
        let foreign = cat.create_resource(&t2, NewResource::root(ResourceType::ProductFamily, "f")).unwrap();

        assert!(matches!(
            cat.move_resource(&t1, app.id, Some(foreign.id)),
            Err(AuthzError::CrossTenantParent(_))
        ));
    }

    #[test]
    fn test_resources_under_path() {
        let cat = catalog();
        let t = ctx(Uuid::new_v4());
        let app = cat.create_resource(&t, NewResource::root(ResourceType::App, "app")).unwrap();
        let e1 = cat.create_resource(&t, NewResource::child(ResourceType::Entity, "e1", app.id)).unwrap();
        cat.create_resource(&t, NewResource::child(ResourceType::Page, "p1", app.id)).unwrap();
        cat.create_resource(&t, NewResource::root(ResourceType::Entity, "elsewhere")).unwrap();

        let entities = cat.resources_under_path(&t, &app.path, Some(ResourceType::Entity));
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, e1.id);
        assert_eq!(cat.resources_under_path(&t, &app.path, None).len(), 3);
    }

    #[test]
    fn test_purge_tenant() {
        let cat = catalog();
        let t = ctx(Uuid::new_v4());
        let app = cat.create_resource(&t, NewResource::root(ResourceType::App, "app")).unwrap();
        cat.purge_tenant(t.tenant_id());
        assert!(!cat.contains(&t, app.id));
    }
}
