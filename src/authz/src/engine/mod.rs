//! Authorization engine facade
//!
//! Owns every component and wires the cross-cutting rules: every decision is
//! audited, every mutation invalidates the cache entries it can affect, and
//! every resolution failure becomes an empty scope set.
//!
//! # Architecture
//!
//! ```text
//! request → TenantRegistry::bind_session → PermissionCache ─miss→ ScopeResolver
//!                                              │                 ├─ RoleGraph
//!                                              │                 ├─ GroupMembership
//!                                              │                 ├─ PermissionStore
//!                                              ↓                 └─ ResourceCatalog
//!                                          Decision → AuditSink
//! ```

mod admin;
mod decision;

pub use decision::{AccessRequest, ConditionEvaluator, Decision, DecisionReason};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use tessera_vault::{CredentialVault, TokenDigest, VaultConfig};

use crate::audit::{AuditEvent, AuditResult, AuditSink, InMemoryAuditSink, RiskScore};
use crate::cache::{CacheConfig, CacheStats, PermissionCache};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{AuthzError, Result};
use crate::groups::GroupMembership;
use crate::permission::{InMemoryPermissionStore, PermissionStore};
use crate::rate_limit::RateLimiter;
use crate::resource::ResourceCatalog;
use crate::roles::RoleGraph;
use crate::scope::{Resolution, ResolvedScopes, ScopeResolver};
use crate::tenant::{TenantContext, TenantRegistry};
use crate::types::{Action, FieldPermissions, ResourceId, ResourceType, TenantId, UserId};

/// Risk scores attached to engine-generated audit events
pub(crate) mod risk {
    pub const ALLOWED: f64 = 0.1;
    pub const MUTATION: f64 = 0.3;
    pub const DENIED: f64 = 0.6;
    pub const RATE_LIMITED: f64 = 0.7;
    pub const DESTRUCTIVE: f64 = 0.7;
    pub const FAILURE: f64 = 0.8;
    pub const ELEVATION: f64 = 0.9;
}

/// Builder for [`AuthzEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    vault: Option<Arc<CredentialVault>>,
    permissions: Option<Arc<dyn PermissionStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            vault: None,
            permissions: None,
            audit: None,
            evaluator: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an existing vault instead of loading secrets from the environment
    pub fn vault(mut self, vault: Arc<CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn permission_store(mut self, store: Arc<dyn PermissionStore>) -> Self {
        self.permissions = Some(store);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn build(self) -> Result<AuthzEngine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| AuthzError::InvalidInput(format!("invalid configuration: {:#}", e)))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let vault = match self.vault {
            Some(vault) => vault,
            None => {
                let vault_config =
                    VaultConfig::from_env(&config.vault.master_key_env, &config.vault.global_salt_env)?;
                Arc::new(CredentialVault::new(vault_config)?)
            }
        };

        let audit = self.audit.unwrap_or_else(|| {
            let sink = InMemoryAuditSink::new();
            sink.provision_months(clock.now(), config.audit.provisioned_months);
            Arc::new(sink) as Arc<dyn AuditSink>
        });

        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(InMemoryPermissionStore::new(clock.clone())) as Arc<dyn PermissionStore>);

        let depth = config.hierarchy.max_inheritance_depth;
        let registry = Arc::new(TenantRegistry::new(clock.clone(), config.hierarchy.max_tenant_depth));
        let catalog = Arc::new(ResourceCatalog::new(clock.clone()));
        let roles = Arc::new(RoleGraph::new(clock.clone(), depth));
        let groups = Arc::new(GroupMembership::new(clock.clone(), depth));

        let resolver = Arc::new(ScopeResolver::new(
            registry.clone(),
            catalog.clone(),
            roles.clone(),
            groups.clone(),
            permissions.clone(),
            clock.clone(),
            config.resolution_timeout(),
        ));

        let cache = PermissionCache::new(
            resolver.clone(),
            clock.clone(),
            CacheConfig {
                capacity: config.cache.capacity,
                ttl: config.cache_ttl(),
            },
        );

        let rate_limiter = RateLimiter::new(config.rate_limit.clone(), clock.clone());

        if !config.engine.dynamic_rbac {
            warn!(
                target: "security",
                fallback_scopes = config.engine.fallback_scopes.len(),
                "Dynamic RBAC disabled; serving fixed fallback scopes"
            );
        }

        info!(
            environment = ?config.engine.environment,
            cache_ttl_secs = config.cache.ttl_secs,
            max_inheritance_depth = depth,
            "Authorization engine initialized"
        );

        Ok(AuthzEngine {
            config,
            clock,
            vault,
            registry,
            catalog,
            roles,
            groups,
            permissions,
            resolver,
            cache,
            rate_limiter,
            audit,
            evaluator: self.evaluator,
        })
    }
}

/// Multi-tenant authorization engine
pub struct AuthzEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    vault: Arc<CredentialVault>,
    registry: Arc<TenantRegistry>,
    catalog: Arc<ResourceCatalog>,
    roles: Arc<RoleGraph>,
    groups: Arc<GroupMembership>,
    permissions: Arc<dyn PermissionStore>,
    resolver: Arc<ScopeResolver>,
    cache: PermissionCache,
    rate_limiter: RateLimiter,
    audit: Arc<dyn AuditSink>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
}

impl AuthzEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Validate a (tenant, user) pair and obtain the handle tenant-scoped calls require
    pub fn bind_session(&self, tenant_id: TenantId, user_id: UserId) -> Result<TenantContext> {
        self.registry.bind_session(tenant_id, user_id)
    }

    /// Effective scopes and field permissions of a user.
    ///
    /// Never fails: any error yields the empty set with `error` populated.
    pub async fn resolve_scopes(&self, tenant_id: TenantId, user_id: UserId) -> Resolution {
        let resolution = self.resolve(tenant_id, user_id).await;

        if let Some(err) = &resolution.error {
            let event = AuditEvent::new("scope.resolve", AuditResult::Failure)
                .tenant(tenant_id)
                .actor(user_id)
                .risk(risk::FAILURE)
                .details(serde_json::json!({ "error": err.to_string() }))
                .at(self.clock.now());
            if let Err(audit_err) = self.audit.record(event).await {
                error!(
                    target: "security",
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    error = %audit_err,
                    "Resolution failure could not be audited"
                );
            }
        }
        resolution
    }

    /// Decide a request, auditing the decision.
    ///
    /// Denials are audited with acknowledgement; if that fails the call
    /// returns `AuditUnavailable` instead of a silent denial.
    pub async fn authorize(&self, request: &AccessRequest) -> Result<Decision> {
        let resolution = self.resolve(request.tenant_id, request.user_id).await;
        let now = self.clock.now();

        let decision = match &resolution.error {
            Some(err) => Decision::deny(
                DecisionReason::ResolutionFailed {
                    error: err.to_string(),
                },
                now,
            ),
            None => match self.foreign_resource(request) {
                Some(reason) => Decision::deny(reason, now),
                None => decision::decide(request, &resolution.scopes, self.evaluator.as_deref(), now),
            },
        };

        let (result, score) = match (decision.allowed, resolution.is_fail_secure()) {
            (true, _) => (AuditResult::Success, risk::ALLOWED),
            (false, false) => (AuditResult::Denied, risk::DENIED),
            (false, true) => (AuditResult::Failure, risk::FAILURE),
        };

        let event = AuditEvent::new("access.check", result)
            .tenant(request.tenant_id)
            .actor(request.user_id)
            .resource(request.resource_key())
            .risk(score)
            .details(serde_json::json!({
                "decision_id": decision.id,
                "action": request.action,
                "reason": decision.reason,
            }))
            .at(now);
        self.audit.record(event).await?;

        Ok(decision)
    }

    /// Fail-closed boolean form of [`Self::authorize`]
    pub async fn check_permission(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        resource_type: ResourceType,
        resource_id: Option<ResourceId>,
        action: Action,
    ) -> bool {
        let mut request = AccessRequest::new(tenant_id, user_id, resource_type, action);
        request.resource_id = resource_id;

        match self.authorize(&request).await {
            Ok(decision) => decision.allowed,
            Err(e) => {
                error!(
                    target: "security",
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    error = %e,
                    "Permission check failed; denying"
                );
                false
            }
        }
    }

    /// Drop a user's cached scopes; the next read recomputes
    pub fn invalidate_user(&self, user_id: UserId) {
        self.cache.invalidate_user(user_id);
    }

    /// Drop every cached scope set of a tenant
    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        self.cache.invalidate_tenant(tenant_id);
    }

    pub fn encrypt_field(&self, plaintext: &str) -> Result<String> {
        Ok(self.vault.encrypt(plaintext)?)
    }

    pub fn decrypt_field(&self, ciphertext: &str) -> Result<String> {
        self.vault.decrypt(ciphertext).map_err(|e| {
            warn!(target: "security", error = %e, "Field decryption failed");
            AuthzError::from(e)
        })
    }

    /// Digest of a bearer token salted with the tenant's salt and the global salt
    pub fn hash_token(&self, tenant_id: TenantId, token: &str) -> Result<TokenDigest> {
        let salt = self.registry.tenant_salt(tenant_id)?;
        Ok(self.vault.hash_token(token, &salt))
    }

    pub fn verify_token(&self, tenant_id: TenantId, token: &str, expected: &TokenDigest) -> Result<bool> {
        let salt = self.registry.tenant_salt(tenant_id)?;
        Ok(self.vault.verify_token(token, &salt, expected))
    }

    /// Count an attempt against the configured limit for `action`; fails closed
    pub async fn check_rate_limit(&self, identifier: &str, action: &str) -> bool {
        match self.enforce_rate_limit(identifier, action).await {
            Ok(()) => true,
            Err(AuthzError::RateLimitExceeded(_)) => false,
            Err(e) => {
                error!(target: "security", action, error = %e, "Rate limit denial could not be audited; denying");
                false
            }
        }
    }

    /// Count an attempt and audit a denial.
    ///
    /// Returns `RateLimitExceeded` once the limit is hit, or `AuditUnavailable`
    /// if the denial could not be recorded.
    pub async fn enforce_rate_limit(&self, identifier: &str, action: &str) -> Result<()> {
        if self.rate_limiter.check(identifier, action) {
            return Ok(());
        }

        let event = AuditEvent::new("rate_limit.exceeded", AuditResult::Denied)
            .resource(format!("rate_limit:{}", action))
            .risk(risk::RATE_LIMITED)
            .details(serde_json::json!({
                "identifier_hash": self.vault.lookup_hash("rate_limit", identifier),
                "action": action,
            }))
            .at(self.clock.now());
        self.audit.record(event).await?;

        Err(AuthzError::RateLimitExceeded(format!("too many '{}' attempts", action)))
    }

    pub async fn record_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.audit.record(event).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Uncached resolution, errors propagated; for diagnostics
    pub async fn explain(&self, tenant_id: TenantId, user_id: UserId) -> Result<ResolvedScopes> {
        self.resolver.try_resolve(tenant_id, user_id).await
    }

    /// Session binding first, then the cache (or the fallback set with dynamic RBAC off)
    async fn resolve(&self, tenant_id: TenantId, user_id: UserId) -> Resolution {
        let now = self.clock.now();
        if let Err(e) = self.registry.bind_session(tenant_id, user_id) {
            warn!(
                target: "security",
                tenant_id = %tenant_id,
                user_id = %user_id,
                error = %e,
                "Session binding failed; denying all"
            );
            return Resolution::denied(e, now);
        }

        if self.config.engine.dynamic_rbac {
            return self.cache.get(tenant_id, user_id).await;
        }

        Resolution::ok(Arc::new(ResolvedScopes {
            scopes: self.config.engine.fallback_scopes.iter().cloned().collect(),
            field_permissions: FieldPermissions::new(),
            conditions: BTreeMap::new(),
            superadmin: false,
            computed_at: now,
            valid_until: None,
        }))
    }

    /// Denial reason when the request names a resource outside its tenant or of another type
    fn foreign_resource(&self, request: &AccessRequest) -> Option<DecisionReason> {
        let resource_id = request.resource_id?;

        let ctx = match self.registry.bind_session(request.tenant_id, request.user_id) {
            Ok(ctx) => ctx,
            Err(e) => {
                return Some(DecisionReason::ResolutionFailed { error: e.to_string() });
            }
        };

        match self.catalog.get(&ctx, resource_id) {
            Ok(resource) if resource.resource_type == request.resource_type => None,
            found => {
                warn!(
                    target: "security",
                    tenant_id = %request.tenant_id,
                    user_id = %request.user_id,
                    resource_id = %resource_id,
                    actual_type = ?found.ok().map(|r| r.resource_type),
                    "Request names a resource outside the tenant catalog; denying"
                );
                Some(DecisionReason::ForeignResource { resource_id })
            }
        }
    }

    /// Record an audit event for an operation, passing its outcome through.
    ///
    /// A failed operation is recorded as a failure. If the operation succeeded
    /// but the event could not be written, the audit error is returned.
    async fn audited<T>(&self, mut event: AuditEvent, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            event.result = AuditResult::Failure;
            event.risk_score = RiskScore::new(event.risk_score.value().max(risk::FAILURE));
            event.details = Some(serde_json::json!({ "error": e.to_string() }));
        }

        match (self.audit.record(event).await, outcome) {
            (Ok(()), outcome) => outcome,
            (Err(audit_err), Ok(_)) => Err(audit_err),
            (Err(audit_err), Err(e)) => {
                error!(target: "security", error = %audit_err, "Failed operation could not be audited");
                Err(e)
            }
        }
    }

    fn event(&self, action: &str, actor: Option<&TenantContext>) -> AuditEvent {
        let event = AuditEvent::new(action, AuditResult::Success)
            .risk(risk::MUTATION)
            .at(self.clock.now());
        match actor {
            Some(ctx) => event.tenant(ctx.tenant_id()).actor(ctx.user_id()),
            None => event,
        }
    }
}
