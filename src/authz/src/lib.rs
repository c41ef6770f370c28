//! # Tessera Authorization Engine
//!
//! Multi-tenant, fail-secure authorization with hierarchical scopes.
//!
//! ## Features
//!
//! - **Tenant isolation**: every tenant-scoped call goes through a validated [`TenantContext`]
//! - **Role and group inheritance** with cycle and depth checks at write time
//! - **Scope resolution** into `resource_type:action[:resource_id]` strings plus field visibility
//! - **Fail-secure**: any resolution error yields the empty scope set
//! - **Per-user cache** with TTL, singleflight and generation-checked invalidation
//! - **Audit trail** with monthly partitions and acknowledged critical events
//! - **Credential vault** integration for encrypted PII and salted token digests
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_authz::{AccessRequest, Action, AuthzEngine, EngineConfig, ResourceType};
//! use tessera_authz::permission::NewPermission;
//! use tessera_authz::roles::NewRole;
//!
//! # async fn run() -> tessera_authz::Result<()> {
//! let engine = AuthzEngine::builder(EngineConfig::default()).build()?;
//!
//! let tenant = engine.create_tenant("acme", None).await?;
//! let user = engine.register_user(tenant.id, "alice@acme.test", false, None).await?;
//! let ctx = engine.bind_session(tenant.id, user.id)?;
//!
//! let editor = engine.create_role(&ctx, NewRole::new("editor", 10)).await?;
//! let perm = engine
//!     .define_permission(&ctx, NewPermission::general(ResourceType::Entity, [Action::Read, Action::Update]))
//!     .await?;
//! engine.attach_permission(&ctx, editor.id, perm.id).await?;
//! engine.assign_role(&ctx, user.id, editor.id, None).await?;
//!
//! let request = AccessRequest::new(tenant.id, user.id, ResourceType::Entity, Action::Update);
//! assert!(engine.authorize(&request).await?.allowed);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod groups;
pub mod inheritance;
pub mod permission;
pub mod rate_limit;
pub mod resource;
pub mod roles;
pub mod scope;
pub mod telemetry;
pub mod tenant;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditResult, AuditSink, BufferedAuditSink, InMemoryAuditSink};
pub use cache::{CacheStats, PermissionCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{AccessRequest, AuthzEngine, ConditionEvaluator, Decision, DecisionReason, EngineBuilder};
pub use error::{AuthzError, Result};
pub use scope::{Resolution, ResolvedScopes, Scope, ScopePattern};
pub use telemetry::init_tracing;
pub use tenant::TenantContext;
pub use types::{Action, FieldVisibility, ResourceType};
