//! Permission definitions and role attachments

mod store;
mod types;

pub use store::{InMemoryPermissionStore, PermissionStore};
pub use types::{NewPermission, Permission, PermissionTarget, TENANT_WIDE_PATH};
