//! TTL-bounded permission cache in front of the scope resolver
//!
//! Keyed by (tenant, user). Concurrent misses for the same key share one
//! resolution. Each key also carries tenant and user generation counters, and
//! a result is stored only if neither generation moved while it was being
//! computed. An invalidation racing an in-flight resolution therefore can
//! never leave the pre-invalidation result behind.
//!
//! Lock order: `tenant_gens` -> `user_gens` -> `entries`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::scope::{Resolution, ResolvedScopes, ScopeResolver};
use crate::types::{TenantId, UserId};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub capacity: usize,

    /// Time-to-live for cached scope sets
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

type CacheKey = (TenantId, UserId);

#[derive(Clone)]
struct CachedEntry {
    scopes: Arc<ResolvedScopes>,
    expires_at: DateTime<Utc>,
}

impl CachedEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
    /// Misses served by another caller's in-flight resolution
    pub coalesced: usize,
    /// Fail-secure results returned without caching
    pub failures: usize,
    /// Results discarded because an invalidation raced them
    pub discarded: usize,
    pub invalidations: usize,
    pub evictions: usize,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Permission cache with singleflight misses and invalidate-on-write
pub struct PermissionCache {
    resolver: Arc<ScopeResolver>,
    clock: Arc<dyn Clock>,
    entries: Arc<DashMap<CacheKey, CachedEntry>>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
    tenant_gens: DashMap<TenantId, u64>,
    user_gens: DashMap<UserId, u64>,
    ttl: chrono::Duration,
    config: CacheConfig,
    stats: Arc<DashMap<String, usize>>,
}

impl PermissionCache {
    pub fn new(resolver: Arc<ScopeResolver>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let ttl = chrono::Duration::from_std(config.ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        Self {
            resolver,
            clock,
            entries: Arc::new(DashMap::new()),
            inflight: DashMap::new(),
            tenant_gens: DashMap::new(),
            user_gens: DashMap::new(),
            ttl,
            config,
            stats: Arc::new(DashMap::new()),
        }
    }

    /// Cached scopes if fresh, otherwise resolve (once per key) and cache
    pub async fn get(&self, tenant_id: TenantId, user_id: UserId) -> Resolution {
        let key = (tenant_id, user_id);

        if let Some(scopes) = self.lookup(&key) {
            self.increment_stat("hits");
            return Resolution::ok(scopes);
        }
        self.increment_stat("misses");

        let lock = self
            .inflight
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let resolution = {
            let _guard = lock.lock().await;

            // Another caller may have filled the entry while we waited
            if let Some(scopes) = self.lookup(&key) {
                self.increment_stat("coalesced");
                Resolution::ok(scopes)
            } else {
                let snapshot = self.generations(&key);
                let resolution = self.resolver.resolve(tenant_id, user_id).await;

                if resolution.is_fail_secure() {
                    self.increment_stat("failures");
                } else {
                    self.store(&key, snapshot, resolution.scopes.clone());
                }
                resolution
            }
        };

        drop(lock);
        self.inflight.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        resolution
    }

    /// Drop every cached entry for a user; later reads re-resolve
    pub fn invalidate_user(&self, user_id: UserId) {
        let mut generation = self.user_gens.entry(user_id).or_insert(0);
        *generation += 1;
        self.entries.retain(|(_, user), _| *user != user_id);
        drop(generation);

        self.increment_stat("invalidations");
        debug!(user_id = %user_id, "Permission cache invalidated for user");
    }

    /// Drop every cached entry of a tenant (role/permission/resource structure changed)
    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        let mut generation = self.tenant_gens.entry(tenant_id).or_insert(0);
        *generation += 1;
        self.entries.retain(|(tenant, _), _| *tenant != tenant_id);
        drop(generation);

        self.increment_stat("invalidations");
        debug!(tenant_id = %tenant_id, "Permission cache invalidated for tenant");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.get_stat("hits"),
            misses: self.get_stat("misses"),
            expirations: self.get_stat("expirations"),
            coalesced: self.get_stat("coalesced"),
            failures: self.get_stat("failures"),
            discarded: self.get_stat("discarded"),
            invalidations: self.get_stat("invalidations"),
            evictions: self.get_stat("evictions"),
            entries: self.entries.len(),
            max_entries: self.config.capacity,
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<ResolvedScopes>> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            self.increment_stat("expirations");
            return None;
        }
        Some(entry.scopes.clone())
    }

    fn generations(&self, key: &CacheKey) -> (u64, u64) {
        let tenant = self.tenant_gens.get(&key.0).map(|g| *g).unwrap_or(0);
        let user = self.user_gens.get(&key.1).map(|g| *g).unwrap_or(0);
        (tenant, user)
    }

    /// Insert only if no invalidation happened since `snapshot` was taken
    fn store(&self, key: &CacheKey, snapshot: (u64, u64), scopes: Arc<ResolvedScopes>) {
        let tenant_gen = self.tenant_gens.entry(key.0).or_insert(0);
        let user_gen = self.user_gens.entry(key.1).or_insert(0);

        if (*tenant_gen, *user_gen) != snapshot {
            self.increment_stat("discarded");
            trace!(tenant_id = %key.0, user_id = %key.1, "Discarding result raced by invalidation");
            return;
        }

        if self.entries.len() >= self.config.capacity {
            self.evict();
        }

        let ttl_expiry = scopes.computed_at + self.ttl;
        let expires_at = scopes.valid_until.map_or(ttl_expiry, |until| until.min(ttl_expiry));
        self.entries.insert(*key, CachedEntry { scopes, expires_at });
    }

    /// Remove expired entries, then the soonest-expiring tenth if still full
    fn evict(&self) {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));

        if self.entries.len() >= self.config.capacity {
            let mut by_expiry: Vec<(CacheKey, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|e| (*e.key(), e.value().expires_at))
                .collect();
            by_expiry.sort_by_key(|(_, expires)| *expires);

            let to_remove = (self.config.capacity / 10).max(1);
            for (key, _) in by_expiry.into_iter().take(to_remove) {
                self.entries.remove(&key);
            }
        }

        let removed = before.saturating_sub(self.entries.len());
        *self.stats.entry("evictions".to_string()).or_insert(0) += removed;
    }

    fn increment_stat(&self, key: &str) {
        *self.stats.entry(key.to_string()).or_insert(0) += 1;
    }

    fn get_stat(&self, key: &str) -> usize {
        self.stats.get(key).map(|v| *v).unwrap_or(0)
    }
}
