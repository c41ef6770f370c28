//! Tenant tree, users and session binding
//!
//! [`TenantRegistry::bind_session`] is the only producer of [`TenantContext`],
//! the handle every tenant-scoped store requires.

mod registry;
mod types;

pub use registry::TenantRegistry;
pub use types::{SuperadminGrant, Tenant, TenantContext, TenantType, User, UserRecord};
