//! Scope resolution: (tenant, user) -> effective scope set
//!
//! [`ScopeResolver::resolve`] is fail-secure. Every internal error, timeout or
//! panic is converted into an empty scope set plus a security log entry; the
//! caller never sees an `Err`.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::fields::{resource_key, FieldMerger};
use super::types::{Scope, ScopePattern, ScopeResult};
use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::groups::GroupMembership;
use crate::permission::{Permission, PermissionStore, PermissionTarget};
use crate::resource::ResourceCatalog;
use crate::roles::RoleGraph;
use crate::tenant::{TenantContext, TenantRegistry};
use crate::types::{Action, Conditions, FieldPermissions, ResourceId, ResourceType, RoleId, TenantId, UserId};

/// Effective permissions of one (tenant, user) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedScopes {
    /// Wire-format scope strings
    pub scopes: BTreeSet<String>,
    /// Resource key -> field -> visibility
    pub field_permissions: FieldPermissions,
    /// Scopes granted only by conditional permissions, with every contributing
    /// condition set. Any one set passing is sufficient.
    pub conditions: BTreeMap<String, Vec<Conditions>>,
    /// Produced by the explicit superadmin grant
    pub superadmin: bool,
    pub computed_at: DateTime<Utc>,
    /// Earliest expiry among the assignments, memberships and group grants
    /// used; the set must not be served at or after this instant
    pub valid_until: Option<DateTime<Utc>>,
}

impl ResolvedScopes {
    pub fn empty(computed_at: DateTime<Utc>) -> Self {
        Self {
            scopes: BTreeSet::new(),
            field_permissions: FieldPermissions::new(),
            conditions: BTreeMap::new(),
            superadmin: false,
            computed_at,
            valid_until: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Scopes present that grant `action`: the resource-specific one first, then the general one
    pub fn grants_for(
        &self,
        resource_type: ResourceType,
        resource_id: Option<ResourceId>,
        action: Action,
    ) -> Vec<String> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(id) = resource_id {
            candidates.push(Scope::specific(resource_type, action, id).to_string());
        }
        candidates.push(Scope::general(resource_type, action).to_string());
        candidates.retain(|s| self.scopes.contains(s));
        candidates
    }

    /// `None` when at least one unconditional permission granted the scope
    pub fn conditions_for(&self, scope: &str) -> Option<&[Conditions]> {
        self.conditions.get(scope).map(|c| c.as_slice())
    }

    /// Scopes matching a consumer pattern such as `entity:*`
    pub fn matching(&self, pattern: &str) -> ScopeResult<Vec<String>> {
        let pattern = ScopePattern::new(pattern)?;
        Ok(self
            .scopes
            .iter()
            .filter(|s| Scope::parse(s).map(|scope| pattern.matches(&scope)).unwrap_or(false))
            .cloned()
            .collect())
    }
}

/// Result of a fail-secure resolution
#[derive(Debug)]
pub struct Resolution {
    pub scopes: Arc<ResolvedScopes>,
    /// Set when the scopes are the fail-secure empty result
    pub error: Option<AuthzError>,
}

impl Resolution {
    pub fn ok(scopes: Arc<ResolvedScopes>) -> Self {
        Self { scopes, error: None }
    }

    pub fn denied(error: AuthzError, at: DateTime<Utc>) -> Self {
        Self {
            scopes: Arc::new(ResolvedScopes::empty(at)),
            error: Some(error),
        }
    }

    pub fn is_fail_secure(&self) -> bool {
        self.error.is_some()
    }
}

/// Every general scope of every resource type
pub fn full_scope_set() -> BTreeSet<String> {
    ResourceType::ALL
        .iter()
        .flat_map(|t| Action::ALL.iter().map(move |a| Scope::general(*t, *a).to_string()))
        .collect()
}

#[derive(Default)]
struct Contribution {
    unconditional: bool,
    conditions: Vec<Conditions>,
}

/// Computes effective scopes from roles, groups, permissions and resources
pub struct ScopeResolver {
    registry: Arc<TenantRegistry>,
    catalog: Arc<ResourceCatalog>,
    roles: Arc<RoleGraph>,
    groups: Arc<GroupMembership>,
    permissions: Arc<dyn PermissionStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ScopeResolver {
    pub fn new(
        registry: Arc<TenantRegistry>,
        catalog: Arc<ResourceCatalog>,
        roles: Arc<RoleGraph>,
        groups: Arc<GroupMembership>,
        permissions: Arc<dyn PermissionStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            catalog,
            roles,
            groups,
            permissions,
            clock,
            timeout,
        }
    }

    /// Fail-secure resolution bounded by the configured deadline
    pub async fn resolve(&self, tenant_id: TenantId, user_id: UserId) -> Resolution {
        let attempt = AssertUnwindSafe(self.try_resolve(tenant_id, user_id)).catch_unwind();

        let error = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(Ok(scopes))) => return Resolution::ok(Arc::new(scopes)),
            Ok(Ok(Err(e))) => e,
            Ok(Err(_panic)) => AuthzError::ResolutionFailure("resolver panicked".to_string()),
            Err(_elapsed) => AuthzError::ResolutionFailure(format!(
                "resolution exceeded {} ms",
                self.timeout.as_millis()
            )),
        };

        warn!(
            target: "security",
            tenant_id = %tenant_id,
            user_id = %user_id,
            error = %error,
            "Scope resolution failed; denying all"
        );
        Resolution::denied(error, self.clock.now())
    }

    /// The resolution algorithm; errors propagate
    pub async fn try_resolve(&self, tenant_id: TenantId, user_id: UserId) -> Result<ResolvedScopes> {
        let ctx = self.registry.bind_session(tenant_id, user_id)?;
        let now = self.clock.now();

        if let Some(grant) = self.registry.superadmin_grant(user_id) {
            debug!(user_id = %user_id, granted_by = %grant.granted_by, "Superadmin short-circuit");
            return Ok(ResolvedScopes {
                scopes: full_scope_set(),
                field_permissions: FieldPermissions::new(),
                conditions: BTreeMap::new(),
                superadmin: true,
                computed_at: now,
                valid_until: None,
            });
        }

        let (role_ids, valid_until) = self.collect_roles(&ctx, now)?;
        if role_ids.is_empty() {
            return Ok(ResolvedScopes::empty(now));
        }

        let priorities = self.roles.priorities(&ctx, &role_ids)?;
        let per_role = try_join_all(
            role_ids
                .iter()
                .map(|role_id| self.permissions.list_permissions_for_role(&ctx, *role_id)),
        )
        .await?;

        let mut contributions: BTreeMap<String, Contribution> = BTreeMap::new();
        let mut fields = FieldMerger::default();

        for (role_id, permissions) in role_ids.iter().zip(per_role) {
            let priority = priorities.get(role_id).copied().ok_or_else(|| {
                AuthzError::ResolutionFailure(format!("role {} has no priority", role_id))
            })?;

            for permission in permissions {
                if permission.tenant_id != ctx.tenant_id() {
                    warn!(
                        target: "security",
                        permission_id = %permission.id,
                        tenant_id = %ctx.tenant_id(),
                        "Dropping permission from another tenant"
                    );
                    continue;
                }

                for resource_id in self.expand_target(&ctx, &permission) {
                    for action in &permission.actions {
                        let scope = match resource_id {
                            Some(id) => Scope::specific(permission.resource_type, *action, id),
                            None => Scope::general(permission.resource_type, *action),
                        };
                        let entry = contributions.entry(scope.to_string()).or_default();
                        match &permission.conditions {
                            Some(c) if !c.is_empty() => entry.conditions.push(c.clone()),
                            _ => entry.unconditional = true,
                        }
                    }

                    let key = resource_key(permission.resource_type, resource_id);
                    for (field, visibility) in &permission.field_permissions {
                        fields.offer(&key, field, priority, *visibility);
                    }
                }
            }
        }

        let mut scopes = BTreeSet::new();
        let mut conditions = BTreeMap::new();
        for (scope, contribution) in contributions {
            if !contribution.unconditional {
                conditions.insert(scope.clone(), contribution.conditions);
            }
            scopes.insert(scope);
        }

        debug!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            roles = role_ids.len(),
            scopes = scopes.len(),
            "Scopes resolved"
        );

        Ok(ResolvedScopes {
            scopes,
            field_permissions: fields.finish(),
            conditions,
            superadmin: false,
            computed_at: now,
            valid_until,
        })
    }

    /// Direct roles, group roles and every ancestor of either, deduplicated,
    /// plus the earliest expiry among the edges that produced them
    fn collect_roles(
        &self,
        ctx: &TenantContext,
        now: DateTime<Utc>,
    ) -> Result<(Vec<RoleId>, Option<DateTime<Utc>>)> {
        let user_id = ctx.user_id();
        let mut expiries = Vec::new();
        let mut seeds = BTreeSet::new();

        for assignment in self.roles.direct_roles(ctx, user_id, now) {
            expiries.extend(assignment.expires_at);
            seeds.insert(assignment.role_id);
        }

        let memberships = self.groups.groups_for_user(ctx, user_id, now);
        expiries.extend(memberships.iter().filter_map(|m| m.expires_at));
        let member_of: Vec<_> = memberships.iter().map(|m| m.group_id).collect();

        for grant in self.groups.roles_for_groups(ctx, &member_of, now)? {
            expiries.extend(grant.expires_at);
            seeds.insert(grant.role_id);
        }

        let mut all = BTreeSet::new();
        for role_id in seeds {
            all.extend(self.roles.resolve_inherited_chain(ctx, role_id)?);
        }
        Ok((all.into_iter().collect(), expiries.into_iter().min()))
    }

    /// Resource ids a permission applies to; `None` stands for the general scope.
    ///
    /// Ids outside the caller's tenant catalog are dropped.
    fn expand_target(&self, ctx: &TenantContext, permission: &Permission) -> Vec<Option<ResourceId>> {
        match permission.target() {
            PermissionTarget::General => vec![None],
            PermissionTarget::Resource(id) => {
                if self.catalog.contains(ctx, id) {
                    vec![Some(id)]
                } else {
                    warn!(
                        target: "security",
                        permission_id = %permission.id,
                        resource_id = %id,
                        "Dropping scope for resource outside the tenant catalog"
                    );
                    Vec::new()
                }
            }
            PermissionTarget::Path(prefix) => self
                .catalog
                .resources_under_path(ctx, prefix, Some(permission.resource_type))
                .into_iter()
                .map(|r| Some(r.id))
                .collect(),
        }
    }
}
