//! Fixed-window rate limiting per (identifier, action)
//!
//! One atomic counter exists per (identifier, action, window start). The count
//! compared against the limit is always the value this call produced, so two
//! concurrent callers can never both observe the last free slot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::clock::Clock;
use crate::config::RateLimitSection;

/// Calls between sweeps of closed windows
const PRUNE_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    identifier: String,
    action: String,
    window_start: i64,
}

#[derive(Debug)]
struct Window {
    count: AtomicU64,
    /// Unix milliseconds
    ends_at: i64,
}

/// Fixed-window attempt counter
pub struct RateLimiter {
    windows: DashMap<WindowKey, Window>,
    rules: RateLimitSection,
    clock: Arc<dyn Clock>,
    calls: AtomicU64,
}

impl RateLimiter {
    pub fn new(rules: RateLimitSection, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            rules,
            clock,
            calls: AtomicU64::new(0),
        }
    }

    /// Record one attempt; false once `max_attempts` is exceeded inside the current window
    pub fn allow(&self, identifier: &str, action: &str, max_attempts: u32, window: Duration) -> bool {
        let window_ms = window_millis(window);
        if max_attempts == 0 || window_ms <= 0 {
            warn!(target: "security", identifier, action, "Rate limit rule admits nothing; denying");
            return false;
        }

        let now = self.clock.now();
        let window_start = window_start(now, window_ms);
        let key = WindowKey {
            identifier: identifier.to_string(),
            action: action.to_string(),
            window_start,
        };

        let count = match self.windows.get(&key) {
            Some(w) => w.count.fetch_add(1, Ordering::SeqCst) + 1,
            None => {
                self.windows
                    .entry(key)
                    .or_insert_with(|| Window {
                        count: AtomicU64::new(0),
                        ends_at: window_start + window_ms,
                    })
                    .count
                    .fetch_add(1, Ordering::SeqCst)
                    + 1
            }
        };

        if self.calls.fetch_add(1, Ordering::Relaxed) % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            self.prune();
        }

        let allowed = count <= u64::from(max_attempts);
        if allowed {
            trace!(identifier, action, count, max_attempts, "Attempt allowed");
        } else {
            warn!(
                target: "security",
                identifier,
                action,
                count,
                max_attempts,
                "Rate limit exceeded"
            );
        }
        allowed
    }

    /// [`Self::allow`] with the configured rule for `action`
    pub fn check(&self, identifier: &str, action: &str) -> bool {
        let rule = self.rules.rule_for(action);
        self.allow(identifier, action, rule.max_attempts, rule.window())
    }

    /// Attempts recorded in the window containing now
    pub fn attempts(&self, identifier: &str, action: &str, window: Duration) -> u64 {
        let window_ms = window_millis(window);
        if window_ms <= 0 {
            return 0;
        }
        let key = WindowKey {
            identifier: identifier.to_string(),
            action: action.to_string(),
            window_start: window_start(self.clock.now(), window_ms),
        };
        self.windows
            .get(&key)
            .map(|w| w.count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Forget every window of (identifier, action), e.g. after a successful login
    pub fn reset(&self, identifier: &str, action: &str) {
        self.windows
            .retain(|k, _| !(k.identifier == identifier && k.action == action));
    }

    /// Drop windows that have closed
    pub fn prune(&self) {
        let now = self.clock.now().timestamp_millis();
        self.windows.retain(|_, w| w.ends_at > now);
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// Start of the window containing `now`, in Unix milliseconds
fn window_start(now: DateTime<Utc>, window_ms: i64) -> i64 {
    now.timestamp_millis().div_euclid(window_ms) * window_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimitRule;
    use chrono::TimeZone;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RateLimiter::new(RateLimitSection::default(), clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_exceeding_max_attempts_in_one_window_is_denied() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.allow("alice@example.com", "login", 3, window));
        }
        assert!(!limiter.allow("alice@example.com", "login", 3, window));
        assert!(!limiter.allow("alice@example.com", "login", 3, window));
        assert_eq!(limiter.attempts("alice@example.com", "login", window), 5);
    }

    #[test]
    fn test_new_window_resets_counter() {
        let (clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        assert!(limiter.allow("alice", "login", 1, window));
        assert!(!limiter.allow("alice", "login", 1, window));

        clock.advance(chrono::Duration::seconds(59));
        assert!(!limiter.allow("alice", "login", 1, window));

        clock.advance(chrono::Duration::seconds(1));
        assert!(limiter.allow("alice", "login", 1, window));
    }

    #[test]
    fn test_sub_second_window() {
        let (clock, limiter) = limiter();
        let window = Duration::from_millis(250);

        assert!(limiter.allow("alice", "poll", 2, window));
        assert!(limiter.allow("alice", "poll", 2, window));
        assert!(!limiter.allow("alice", "poll", 2, window));

        clock.advance(chrono::Duration::milliseconds(250));
        assert!(limiter.allow("alice", "poll", 2, window));
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        assert!(limiter.allow("alice", "login", 1, window));
        assert!(!limiter.allow("alice", "login", 1, window));
        assert!(limiter.allow("alice", "password_reset", 1, window));
        assert!(limiter.allow("bob", "login", 1, window));
    }

    #[test]
    fn test_zero_limit_denies() {
        let (_clock, limiter) = limiter();
        assert!(!limiter.allow("alice", "login", 0, Duration::from_secs(60)));
        assert!(!limiter.allow("alice", "login", 5, Duration::from_secs(0)));
    }

    #[test]
    fn test_check_uses_configured_override() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let mut rules = RateLimitSection::default();
        rules.overrides.insert(
            "login".to_string(),
            RateLimitRule {
                max_attempts: 2,
                window_secs: 300,
            },
        );
        let limiter = RateLimiter::new(rules, clock);

        assert!(limiter.check("alice", "login"));
        assert!(limiter.check("alice", "login"));
        assert!(!limiter.check("alice", "login"));

        // Default rule: 5 per 60s
        for _ in 0..5 {
            assert!(limiter.check("alice", "export"));
        }
        assert!(!limiter.check("alice", "export"));
    }

    #[test]
    fn test_reset_and_prune() {
        let (clock, limiter) = limiter();
        let window = Duration::from_secs(60);

        limiter.allow("alice", "login", 1, window);
        limiter.allow("bob", "login", 1, window);
        limiter.reset("alice", "login");
        assert!(limiter.allow("alice", "login", 1, window));

        clock.advance(chrono::Duration::seconds(120));
        limiter.prune();
        assert_eq!(limiter.tracked_windows(), 0);
    }

    #[test]
    fn test_concurrent_callers_share_one_counter() {
        let (_clock, limiter) = limiter();
        let limiter = Arc::new(limiter);
        let window = Duration::from_secs(60);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.allow("shared", "login", 25, window))
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 25);
    }
}
