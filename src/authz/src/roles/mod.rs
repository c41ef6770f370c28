//! Roles, role inheritance and direct user -> role assignments

mod graph;
mod types;

pub use graph::RoleGraph;
pub use types::{NewRole, Role, UserRole};
