//! Error types for the authorization engine

use thiserror::Error;
use tessera_vault::VaultError;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// User is missing or does not belong to the requested tenant
    #[error("Tenant/user mismatch: {0}")]
    TenantUserMismatch(String),

    /// Tenant, one of its ancestors, or the user is deactivated
    #[error("Inactive tenant or user: {0}")]
    InactiveTenantOrUser(String),

    /// A parent assignment would close a cycle
    #[error("Circular inheritance: {0}")]
    CircularInheritance(String),

    /// A chain exceeds its configured depth bound
    #[error("Hierarchy too deep: {0}")]
    HierarchyTooDeep(String),

    /// Parent lives in a different tenant
    #[error("Cross-tenant parent: {0}")]
    CrossTenantParent(String),

    /// Permission definition is structurally invalid
    #[error("Malformed permission: {0}")]
    MalformedPermission(String),

    /// Ciphertext could not be authenticated or decoded
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Rate limit window exhausted
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Catch-all internal failure during scope resolution
    #[error("Resolution failure: {0}")]
    ResolutionFailure(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violated
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Audit sink could not durably accept an event
    #[error("Audit sink unavailable: {0}")]
    AuditUnavailable(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Vault error other than a decryption failure
    #[error("Vault error: {0}")]
    Vault(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<VaultError> for AuthzError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::DecryptionFailed(_) => AuthzError::DecryptionFailed,
            other => AuthzError::Vault(other.to_string()),
        }
    }
}

impl AuthzError {
    /// Write-time structural violation that must be surfaced to the caller
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            AuthzError::CircularInheritance(_)
                | AuthzError::HierarchyTooDeep(_)
                | AuthzError::CrossTenantParent(_)
                | AuthzError::MalformedPermission(_)
        )
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
