//! Cross-cutting guarantees: tenant isolation, fail-secure resolution,
//! encrypted identity attributes and per-tenant token digests.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use tessera_authz::clock::{Clock, SystemClock};
use tessera_authz::config::EngineConfig;
use tessera_authz::permission::{InMemoryPermissionStore, NewPermission, Permission, PermissionStore};
use tessera_authz::resource::NewResource;
use tessera_authz::roles::NewRole;
use tessera_authz::tenant::TenantContext;
use tessera_authz::types::{Action, PermissionId, ResourceType, RoleId, TenantId};
use tessera_authz::{AccessRequest, AuthzError, DecisionReason, Result};

// ============================================================================
// FAULT-INJECTING STORE
// ============================================================================

/// Permission store that can be told to fail or stall on reads
struct FlakyStore {
    inner: InMemoryPermissionStore,
    failing: AtomicBool,
    stall_ms: AtomicU64,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryPermissionStore::new(Arc::new(SystemClock) as Arc<dyn Clock>),
            failing: AtomicBool::new(false),
            stall_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PermissionStore for FlakyStore {
    async fn define_permission(&self, ctx: &TenantContext, new: NewPermission) -> Result<Permission> {
        self.inner.define_permission(ctx, new).await
    }

    async fn get_permission(&self, ctx: &TenantContext, id: PermissionId) -> Result<Option<Permission>> {
        self.inner.get_permission(ctx, id).await
    }

    async fn revise_permission(&self, ctx: &TenantContext, id: PermissionId, new: NewPermission) -> Result<Permission> {
        self.inner.revise_permission(ctx, id, new).await
    }

    async fn attach(&self, ctx: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<()> {
        self.inner.attach(ctx, role_id, permission_id).await
    }

    async fn detach(&self, ctx: &TenantContext, role_id: RoleId, permission_id: PermissionId) -> Result<bool> {
        self.inner.detach(ctx, role_id, permission_id).await
    }

    async fn list_permissions_for_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<Vec<Permission>> {
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthzError::DatabaseError("connection reset".to_string()));
        }
        self.inner.list_permissions_for_role(ctx, role_id).await
    }

    async fn forget_role(&self, ctx: &TenantContext, role_id: RoleId) -> Result<()> {
        self.inner.forget_role(ctx, role_id).await
    }

    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        self.inner.purge_tenant(tenant_id).await
    }
}

async fn flaky_harness(config: EngineConfig) -> (Harness, Arc<FlakyStore>, TenantId, uuid::Uuid) {
    let store = Arc::new(FlakyStore::new());
    let h = Harness::with_store(config, store.clone() as Arc<dyn PermissionStore>);
    let (tenant, ctx) = h.tenant("acme").await;
    let role = h
        .role_with(&ctx, "operator", 1, ResourceType::Service, &[Action::Execute])
        .await;
    h.engine.assign_role(&ctx, ctx.user_id(), role.id, None).await.unwrap();
    (h, store, tenant.id, ctx.user_id())
}

// ============================================================================
// FAIL-SECURE RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_store_error_yields_empty_scopes() {
    let (h, store, tenant_id, user_id) = flaky_harness(EngineConfig::default()).await;
    store.failing.store(true, Ordering::SeqCst);

    let resolution = h.engine.resolve_scopes(tenant_id, user_id).await;
    assert!(resolution.is_fail_secure());
    assert!(resolution.scopes.is_empty());

    let request = AccessRequest::new(tenant_id, user_id, ResourceType::Service, Action::Execute);
    let decision = h.engine.authorize(&request).await.unwrap();
    assert!(!decision.allowed);
    assert!(matches!(decision.reason, DecisionReason::ResolutionFailed { .. }));
    assert_eq!(h.engine.cache_stats().entries, 0);
    assert!(h.engine.cache_stats().failures >= 2);

    // Recovery is immediate because failures were never cached
    store.failing.store(false, Ordering::SeqCst);
    assert!(
        h.engine
            .check_permission(tenant_id, user_id, ResourceType::Service, None, Action::Execute)
            .await
    );
}

#[tokio::test]
async fn test_slow_store_times_out_to_denial() {
    let mut config = EngineConfig::default();
    config.engine.resolution_timeout_ms = 50;
    let (h, store, tenant_id, user_id) = flaky_harness(config).await;
    store.stall_ms.store(500, Ordering::SeqCst);

    let resolution = h.engine.resolve_scopes(tenant_id, user_id).await;
    assert!(resolution.is_fail_secure());
    assert!(matches!(resolution.error, Some(AuthzError::ResolutionFailure(_))));

    // Diagnostics surface the underlying error instead of masking it
    store.stall_ms.store(0, Ordering::SeqCst);
    store.failing.store(true, Ordering::SeqCst);
    let err = h.engine.explain(tenant_id, user_id).await.unwrap_err();
    assert!(matches!(err, AuthzError::DatabaseError(_)));
}

// ============================================================================
// TENANT ISOLATION
// ============================================================================

#[tokio::test]
async fn test_session_binding_rejects_foreign_tenant() {
    let h = Harness::new();
    let (acme, acme_ctx) = h.tenant("acme").await;
    let (globex, _globex_ctx) = h.tenant("globex").await;

    let err = h.engine.bind_session(globex.id, acme_ctx.user_id()).unwrap_err();
    assert!(matches!(err, AuthzError::TenantUserMismatch(_)));

    // Even a sub-tenant does not accept the parent's users
    let division = h.engine.create_tenant("acme-emea", Some(acme.id)).await.unwrap();
    let err = h.engine.bind_session(division.id, acme_ctx.user_id()).unwrap_err();
    assert!(matches!(err, AuthzError::TenantUserMismatch(_)));

    let resolution = h.engine.resolve_scopes(globex.id, acme_ctx.user_id()).await;
    assert!(resolution.is_fail_secure());
}

#[tokio::test]
async fn test_admin_cannot_assign_roles_to_foreign_users() {
    let h = Harness::new();
    let (_acme, acme_ctx) = h.tenant("acme").await;
    let (globex, globex_ctx) = h.tenant("globex").await;
    let victim = h.user(&globex, "victim@globex.test").await;

    let role = h.role_with(&acme_ctx, "owner", 100, ResourceType::App, &Action::ALL).await;
    let err = h.engine.assign_role(&acme_ctx, victim.id, role.id, None).await.unwrap_err();
    assert!(matches!(err, AuthzError::TenantUserMismatch(_)));

    // Roles and resources of another tenant are invisible
    assert!(matches!(
        h.engine.get_role(&globex_ctx, role.id),
        Err(AuthzError::NotFound(_))
    ));
    assert!(h.engine.list_roles(&globex_ctx).is_empty());
}

#[tokio::test]
async fn test_foreign_resource_permission_produces_no_scope() {
    let h = Harness::new();
    let (acme, acme_ctx) = h.tenant("acme").await;
    let (_globex, globex_ctx) = h.tenant("globex").await;

    let secret = h
        .engine
        .create_resource(&globex_ctx, NewResource::root(ResourceType::App, "payroll"))
        .await
        .unwrap();

    let role = h.engine.create_role(&acme_ctx, NewRole::new("snoop", 1)).await.unwrap();
    let permission = h
        .engine
        .define_permission(&acme_ctx, NewPermission::for_resource(ResourceType::App, secret.id, [Action::Read]))
        .await
        .unwrap();
    h.engine.attach_permission(&acme_ctx, role.id, permission.id).await.unwrap();
    h.engine.assign_role(&acme_ctx, acme_ctx.user_id(), role.id, None).await.unwrap();

    let scopes = h.engine.resolve_scopes(acme.id, acme_ctx.user_id()).await.scopes;
    assert!(scopes.is_empty());
    assert!(h.engine.get_resource(&acme_ctx, secret.id).is_err());
}

#[tokio::test]
async fn test_delete_tenant_cascades() {
    let h = Harness::new();
    let (parent, parent_ctx) = h.tenant("holding").await;
    let child = h.engine.create_tenant("subsidiary", Some(parent.id)).await.unwrap();

    let err = h
        .engine
        .delete_tenant(Some(parent_ctx.user_id()), parent.id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::InvalidInput(_)));

    let removed = h
        .engine
        .delete_tenant(Some(parent_ctx.user_id()), parent.id, true)
        .await
        .unwrap();
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&child.id));
    assert!(matches!(h.engine.get_tenant(child.id), Err(AuthzError::NotFound(_))));
    assert!(h.engine.bind_session(parent.id, parent_ctx.user_id()).is_err());
}

#[tokio::test]
async fn test_tenant_ancestry_queries() {
    let h = Harness::new();
    let (root, _ctx) = h.tenant("root").await;
    let mid = h.engine.create_tenant("mid", Some(root.id)).await.unwrap();
    let leaf = h.engine.create_tenant("leaf", Some(mid.id)).await.unwrap();

    assert_eq!(h.engine.tenant_ancestry(leaf.id).unwrap(), vec![root.id, mid.id, leaf.id]);
    assert!(h.engine.is_descendant_tenant(leaf.id, root.id).unwrap());
    assert!(!h.engine.is_descendant_tenant(root.id, leaf.id).unwrap());
    let children: Vec<_> = h.engine.list_child_tenants(root.id).unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(children, vec![mid.id]);
}

// ============================================================================
// IDENTITY ATTRIBUTES AND TOKENS
// ============================================================================

#[tokio::test]
async fn test_email_stored_encrypted_and_searchable() {
    let h = Harness::new();
    let (tenant, _ctx) = h.tenant("acme").await;
    let attributes = json!({ "department": "finance", "clearance": 2 });
    let dana = h
        .engine
        .register_user(tenant.id, "  Dana@Acme.Test ", false, Some(&attributes))
        .await
        .unwrap();

    assert!(!dana.email_encrypted.contains("dana"));
    assert_eq!(h.engine.user_email(dana.id).unwrap(), "dana@acme.test");
    assert_eq!(h.engine.user_attributes(dana.id).unwrap(), Some(attributes));

    let found = h.engine.find_user_by_email(tenant.id, "DANA@acme.test").unwrap();
    assert_eq!(found.id, dana.id);

    // Lookups never cross tenants
    let (other, _) = h.tenant("globex").await;
    assert!(h.engine.find_user_by_email(other.id, "dana@acme.test").is_none());

    let err = h
        .engine
        .register_user(tenant.id, "dana@acme.test", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Duplicate(_)));
}

#[tokio::test]
async fn test_tampered_ciphertext_fails_decryption() {
    let h = Harness::new();
    let ciphertext = h.engine.encrypt_field("555-12-3456").unwrap();

    // Flip one base64 character inside the nonce, past the `v1.` prefix
    let mut tampered = ciphertext.clone().into_bytes();
    let at = "v1.".len() + 5;
    tampered[at] = if tampered[at] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(tampered).unwrap();

    assert_eq!(h.engine.decrypt_field(&ciphertext).unwrap(), "555-12-3456");
    assert!(matches!(h.engine.decrypt_field(&tampered), Err(AuthzError::DecryptionFailed)));
}

#[tokio::test]
async fn test_token_digest_differs_per_tenant() {
    let h = Harness::new();
    let (acme, _) = h.tenant("acme").await;
    let (globex, _) = h.tenant("globex").await;
    let token = "tsk_live_0123456789abcdef";

    let acme_digest = h.engine.hash_token(acme.id, token).unwrap();
    let globex_digest = h.engine.hash_token(globex.id, token).unwrap();
    assert_ne!(acme_digest, globex_digest);

    assert!(h.engine.verify_token(acme.id, token, &acme_digest).unwrap());
    assert!(!h.engine.verify_token(globex.id, token, &acme_digest).unwrap());
    assert!(!h.engine.verify_token(acme.id, "tsk_live_wrong", &acme_digest).unwrap());
}

// ============================================================================
// RATE LIMITING
// ============================================================================

#[tokio::test]
async fn test_rate_limit_override_per_action() {
    let mut config = EngineConfig::default();
    config.rate_limit.overrides.insert(
        "token_refresh".to_string(),
        tessera_authz::config::RateLimitRule {
            max_attempts: 2,
            window_secs: 10,
        },
    );
    let h = Harness::with_config(config);

    h.engine.enforce_rate_limit("client-1", "token_refresh").await.unwrap();
    h.engine.enforce_rate_limit("client-1", "token_refresh").await.unwrap();
    let err = h.engine.enforce_rate_limit("client-1", "token_refresh").await.unwrap_err();
    assert!(matches!(err, AuthzError::RateLimitExceeded(_)));

    // Other identifiers and actions have their own budgets
    assert!(h.engine.check_rate_limit("client-2", "token_refresh").await);
    assert!(h.engine.check_rate_limit("client-1", "login").await);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_share_one_resolution() {
    let h = Arc::new(Harness::new());
    let (tenant, ctx) = h.tenant("acme").await;
    let role = h.role_with(&ctx, "reader", 1, ResourceType::Page, &[Action::Read]).await;
    h.engine.assign_role(&ctx, ctx.user_id(), role.id, None).await.unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let h = h.clone();
            let (tenant_id, user_id) = (tenant.id, ctx.user_id());
            tokio::spawn(async move {
                h.engine
                    .check_permission(tenant_id, user_id, ResourceType::Page, None, Action::Read)
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap());
    }

    let stats = h.engine.cache_stats();
    assert_eq!(stats.hits + stats.coalesced + 1, 16);
    assert_eq!(stats.entries, 1);
}
