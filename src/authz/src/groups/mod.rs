//! Groups, group inheritance, memberships and group -> role grants

mod membership;
mod types;

pub use membership::GroupMembership;
pub use types::{Group, GroupRole, UserGroup};
