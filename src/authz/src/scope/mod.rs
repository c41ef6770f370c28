//! Scope resolution module
//!
//! Turns a user's roles, groups and permissions into the wire-format scope
//! set consumers string-match against.
//!
//! # Examples
//!
//! ```
//! use tessera_authz::scope::{Scope, ScopePattern};
//!
//! let scope = Scope::parse("entity:read").unwrap();
//! assert!(ScopePattern::new("entity:*").unwrap().matches(&scope));
//! ```

mod fields;
mod resolver;
mod types;

pub use fields::resource_key;
pub use resolver::{full_scope_set, Resolution, ResolvedScopes, ScopeResolver};
pub use types::{Scope, ScopeError, ScopePattern, ScopeResult};
