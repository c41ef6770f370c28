//! Audit sink trait and the in-memory partitioned implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::types::{AuditEvent, PartitionKey};
use crate::error::{AuthzError, Result};
use crate::types::{TenantId, UserId};

/// Append-only destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably record one event
    async fn record(&self, event: AuditEvent) -> Result<()>;

    /// Wait until every previously accepted event is written
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    provisioned: BTreeSet<PartitionKey>,
    partitions: BTreeMap<PartitionKey, Vec<(u64, AuditEvent)>>,
    next_seq: u64,
}

/// In-memory sink with monthly partitions and a catch-all default partition
pub struct InMemoryAuditSink {
    state: RwLock<SinkState>,
    available: AtomicBool,
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SinkState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Provision `count` monthly partitions starting at the month of `from`
    pub fn provision_months(&self, from: DateTime<Utc>, count: u32) {
        let mut state = self.state.write();
        let mut key = PartitionKey::month_of(from);
        for _ in 0..count {
            state.provisioned.insert(key);
            match key.next() {
                Some(next) => key = next,
                None => break,
            }
        }
        debug!(from = %PartitionKey::month_of(from), count, "Audit partitions provisioned");
    }

    /// Partition an event created at `at` would land in
    pub fn partition_for(&self, at: DateTime<Utc>) -> PartitionKey {
        let key = PartitionKey::month_of(at);
        if self.state.read().provisioned.contains(&key) {
            key
        } else {
            PartitionKey::Default
        }
    }

    /// Simulate an outage; `record` fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every event in the order it was recorded
    pub fn events(&self) -> Vec<AuditEvent> {
        self.collect(|_| true)
    }

    pub fn events_for_tenant(&self, tenant_id: TenantId) -> Vec<AuditEvent> {
        self.collect(|e| e.tenant_id == Some(tenant_id))
    }

    pub fn events_for_actor(&self, actor_id: UserId) -> Vec<AuditEvent> {
        self.collect(|e| e.actor_id == Some(actor_id))
    }

    pub fn partition_len(&self, key: PartitionKey) -> usize {
        self.state.read().partitions.get(&key).map_or(0, |p| p.len())
    }

    pub fn len(&self) -> usize {
        self.state.read().partitions.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retention: drop whole monthly partitions older than `cutoff`'s month.
    /// The default partition is never dropped. Returns the number of events removed.
    pub fn drop_partitions_before(&self, cutoff: DateTime<Utc>) -> usize {
        let cutoff = PartitionKey::month_of(cutoff);
        let mut state = self.state.write();

        let expired: Vec<PartitionKey> = state
            .partitions
            .keys()
            .chain(state.provisioned.iter())
            .filter(|k| matches!(k, PartitionKey::Month { .. }) && **k < cutoff)
            .copied()
            .collect();

        let mut removed = 0;
        for key in expired {
            state.provisioned.remove(&key);
            if let Some(events) = state.partitions.remove(&key) {
                removed += events.len();
            }
        }

        info!(cutoff = %cutoff, removed, "Audit partitions dropped");
        removed
    }

    fn collect(&self, filter: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        let state = self.state.read();
        let mut events: Vec<&(u64, AuditEvent)> = state
            .partitions
            .values()
            .flatten()
            .filter(|(_, e)| filter(e))
            .collect();
        events.sort_by_key(|(seq, _)| *seq);
        events.into_iter().map(|(_, e)| e.clone()).collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuthzError::AuditUnavailable("in-memory sink offline".to_string()));
        }

        let key = self.partition_for(event.created_at);
        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.partitions.entry(key).or_default().push((seq, event));
        Ok(())
    }
}
