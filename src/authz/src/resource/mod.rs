//! Resource catalog
//!
//! Resources form a per-tenant tree (product_family -> app -> capability ->
//! service -> entity/page/api). Each node stores its materialized path and a
//! BLAKE3 digest of it for indexed lookup.

mod catalog;
mod types;

pub use catalog::ResourceCatalog;
pub use types::{NewResource, Resource};
