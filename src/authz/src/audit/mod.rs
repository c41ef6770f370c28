//! Audit trail for authorization decisions and security-relevant mutations
//!
//! - [`InMemoryAuditSink`]: monthly partitions, default catch-all, retention
//! - [`BufferedAuditSink`]: bounded ordered queue with retry and acknowledged
//!   critical writes
//! - `PostgresAuditSink` (feature `postgres`): partitioned `audit_events` table

mod buffered;
#[cfg(feature = "postgres")]
mod postgres;
mod sink;
mod types;

pub use buffered::BufferedAuditSink;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAuditSink;
pub use sink::{AuditSink, InMemoryAuditSink};
pub use types::{AuditEvent, AuditResult, PartitionKey, RiskScore, CRITICAL_RISK};
