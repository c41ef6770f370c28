//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use tessera_authz::audit::InMemoryAuditSink;
use tessera_authz::clock::{Clock, ManualClock};
use tessera_authz::config::EngineConfig;
use tessera_authz::permission::{NewPermission, PermissionStore};
use tessera_authz::roles::{NewRole, Role};
use tessera_authz::tenant::{Tenant, TenantContext, User};
use tessera_authz::types::{Action, ResourceType};
use tessera_authz::{AuditSink, AuthzEngine, EngineBuilder};
use tessera_vault::{CredentialVault, GlobalSalt, MasterKey, VaultConfig};

pub fn test_vault() -> Arc<CredentialVault> {
    let config = VaultConfig {
        master_key: MasterKey::from_bytes(&[7u8; 32]).unwrap(),
        global_salt: GlobalSalt::from_bytes(&[9u8; 32]).unwrap(),
    };
    Arc::new(CredentialVault::new(config).unwrap())
}

pub struct Harness {
    pub engine: AuthzEngine,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<InMemoryAuditSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, |builder| builder)
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn PermissionStore>) -> Self {
        Self::build(config, move |builder| builder.permission_store(store))
    }

    /// Engine with builder overrides (store, evaluator, sink) applied on top of the fixtures
    pub fn build(config: EngineConfig, customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()));
        let audit = Arc::new(InMemoryAuditSink::new());
        audit.provision_months(clock.now(), 3);

        let builder = AuthzEngine::builder(config)
            .clock(clock.clone() as Arc<dyn Clock>)
            .vault(test_vault())
            .audit_sink(audit.clone() as Arc<dyn AuditSink>);
        let engine = customize(builder).build().unwrap();

        Self { engine, clock, audit }
    }

    /// New root tenant with one bound admin user
    pub async fn tenant(&self, name: &str) -> (Tenant, TenantContext) {
        let tenant = self.engine.create_tenant(name, None).await.unwrap();
        let admin = self.user(&tenant, &format!("admin@{}.test", name)).await;
        let ctx = self.engine.bind_session(tenant.id, admin.id).unwrap();
        (tenant, ctx)
    }

    pub async fn user(&self, tenant: &Tenant, email: &str) -> User {
        self.engine.register_user(tenant.id, email, false, None).await.unwrap()
    }

    /// Role holding one general permission
    pub async fn role_with(
        &self,
        ctx: &TenantContext,
        name: &str,
        priority: i32,
        resource_type: ResourceType,
        actions: &[Action],
    ) -> Role {
        let role = self.engine.create_role(ctx, NewRole::new(name, priority)).await.unwrap();
        let permission = self
            .engine
            .define_permission(ctx, NewPermission::general(resource_type, actions.iter().copied()))
            .await
            .unwrap();
        self.engine.attach_permission(ctx, role.id, permission.id).await.unwrap();
        role
    }
}
