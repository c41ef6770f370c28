//! Tenant, user and session-binding types

use chrono::{DateTime, Utc};
use serde::Serialize;
use tessera_vault::TenantSalt;

use crate::types::{TenantId, UserId};

/// Position of a tenant in the tenant tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantType {
    Root,
    SubTenant,
}

/// Isolated customer or organizational unit
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub parent_tenant_id: Option<TenantId>,
    pub tenant_type: TenantType,
    /// Own activation flag; effective activity also depends on ancestors
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) salt: TenantSalt,
}

impl Tenant {
    /// Immutable salt mixed into this tenant's token digests
    pub fn salt(&self) -> &TenantSalt {
        &self.salt
    }
}

/// User record as stored by the registry.
///
/// PII is held only in encrypted form together with keyed lookup hashes.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub is_active: bool,
    pub is_service_account: bool,
    pub email_encrypted: String,
    pub email_lookup: String,
    pub attributes_encrypted: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::tenant::TenantRegistry::register_user`]
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub tenant_id: TenantId,
    pub is_service_account: bool,
    pub email_encrypted: String,
    pub email_lookup: String,
    pub attributes_encrypted: Option<String>,
}

/// Explicit platform-superadmin grant
///
/// The only elevation path. Granted and revoked through audited engine calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuperadminGrant {
    pub user_id: UserId,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
    pub reason: String,
}

/// Validated (tenant, user) binding.
///
/// Only [`crate::tenant::TenantRegistry::bind_session`] can produce one, so
/// every tenant-scoped read requires a successful binding first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
    user_id: UserId,
    bound_at: DateTime<Utc>,
}

impl TenantContext {
    pub(crate) fn new(tenant_id: TenantId, user_id: UserId, bound_at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            user_id,
            bound_at,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn bound_at(&self) -> DateTime<Utc> {
        self.bound_at
    }
}
