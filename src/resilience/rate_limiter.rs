use super::strategies::{Admission, StrategyConfig, StrategyState};
use crate::telemetry;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Wire form of an admission check: `{allowed, retry_after_ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

impl From<Admission> for CheckResult {
    fn from(a: Admission) -> Self {
        Self {
            allowed: a.is_allowed(),
            retry_after_ms: a.retry_after().map(|d| d.as_millis() as u64).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub key: String,
    pub strategy_id: &'static str,
    pub capacity: f64,
    pub available: f64,
    pub utilization_percent: f64,
    pub idle_ms: u64,
}

/// Cumulative admission counters across all keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub allowed: u64,
    pub rejected: u64,
}

impl LimiterStats {
    pub fn rejection_ratio(&self) -> f64 {
        let total = self.allowed + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.rejected as f64 / total as f64
        }
    }

    /// Counters accumulated since `earlier`.
    pub fn since(&self, earlier: &LimiterStats) -> LimiterStats {
        LimiterStats {
            allowed: self.allowed.saturating_sub(earlier.allowed),
            rejected: self.rejected.saturating_sub(earlier.rejected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Strategy used for keys without an override.
    pub default_strategy: StrategyConfig,
    /// Exact-key overrides.
    pub key_overrides: HashMap<String, StrategyConfig>,
    /// Key-prefix overrides; the longest matching prefix wins.
    pub prefix_overrides: Vec<(String, StrategyConfig)>,
    /// Entries unused for this long are evicted.
    pub idle_ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyConfig::default(),
            key_overrides: HashMap::new(),
            prefix_overrides: Vec::new(),
            idle_ttl: Duration::from_secs(600),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_key_strategy(mut self, key: impl Into<String>, strategy: StrategyConfig) -> Self {
        self.key_overrides.insert(key.into(), strategy);
        self
    }

    pub fn with_prefix_strategy(
        mut self,
        prefix: impl Into<String>,
        strategy: StrategyConfig,
    ) -> Self {
        self.prefix_overrides.push((prefix.into(), strategy));
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Strategy that applies to `key`.
    pub fn strategy_for(&self, key: &str) -> &StrategyConfig {
        if let Some(s) = self.key_overrides.get(key) {
            return s;
        }
        self.prefix_overrides
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, s)| s)
            .unwrap_or(&self.default_strategy)
    }
}

#[derive(Debug)]
struct Entry {
    strategy_id: &'static str,
    state: StrategyState,
    last_used: Instant,
}

/// Per-key rate limiter.
///
/// The key map is only write-locked to insert or evict entries; each entry has
/// its own mutex, so a hot key never blocks admission for other keys.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Windows configured below 1ms run as 1ms windows; other invalid
    /// parameters are logged here. `ReliabilityConfig::validate` rejects both.
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let strategies = std::iter::once(("default", &cfg.default_strategy))
            .chain(cfg.key_overrides.iter().map(|(k, s)| (k.as_str(), s)))
            .chain(cfg.prefix_overrides.iter().map(|(p, s)| (p.as_str(), s)));
        for (scope, strategy) in strategies {
            if let Some(reason) = strategy.invalid_reason() {
                warn!(
                    scope,
                    strategy = strategy.strategy_id(),
                    reason,
                    "invalid rate limit strategy"
                );
            }
        }
        Self {
            cfg,
            entries: RwLock::new(HashMap::new()),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn entry(&self, key: &str, now: Instant) -> Result<Arc<Mutex<Entry>>> {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| Error::poisoned("rate_limiter"))?;
            if let Some(e) = entries.get(key) {
                return Ok(Arc::clone(e));
            }
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::poisoned("rate_limiter"))?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            let strategy = self.cfg.strategy_for(key);
            debug!(key, strategy = strategy.strategy_id(), "rate limit entry created");
            Arc::new(Mutex::new(Entry {
                strategy_id: strategy.strategy_id(),
                state: StrategyState::new(strategy, now),
                last_used: now,
            }))
        });
        Ok(Arc::clone(entry))
    }

    /// Try to admit `cost` units for `key` without waiting.
    pub fn consume(&self, key: &str, cost: u32) -> Result<Admission> {
        let now = Instant::now();
        let entry = self.entry(key, now)?;
        let (admission, utilization) = {
            let mut e = entry.lock().map_err(|_| Error::poisoned("rate_limiter"))?;
            e.last_used = now;
            let admission = e.state.try_consume(cost as f64, now);
            (admission, e.state.utilization_percent(now))
        };
        if admission.is_allowed() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key, cost, retry_after = ?admission.retry_after(), "rate limit rejected");
        }
        telemetry::record_limiter_utilization(key, utilization);
        Ok(admission)
    }

    /// Admission check in wire form.
    pub fn check(&self, key: &str, cost: u32) -> Result<CheckResult> {
        self.consume(key, cost).map(CheckResult::from)
    }

    /// Wait up to `max_wait` for admission.
    ///
    /// Sleeps for the advertised retry hint between attempts. Fails with
    /// [`Error::RateLimited`] if admission cannot happen within `max_wait`.
    pub async fn acquire(&self, key: &str, cost: u32, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.consume(key, cost)? {
                Admission::Allowed => return Ok(()),
                Admission::Rejected { retry_after, .. } => {
                    let Some(wait) = retry_after else {
                        return Err(Error::RateLimited {
                            key: key.to_string(),
                            retry_after: None,
                        });
                    };
                    let now = Instant::now();
                    let wait = wait.max(Duration::from_millis(1));
                    if now + wait > deadline {
                        return Err(Error::RateLimited {
                            key: key.to_string(),
                            retry_after: Some(wait),
                        });
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Remove entries idle for longer than the configured TTL. Returns how many
    /// were evicted.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.cfg.idle_ttl;
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| match e.lock() {
            Ok(e) => now.saturating_duration_since(e.last_used) < ttl,
            Err(_) => false,
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted idle rate limit entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<RateLimitSnapshot> {
        let now = Instant::now();
        let entry = self.entries.read().ok()?.get(key).cloned()?;
        let mut e = entry.lock().ok()?;
        let strategy = self.cfg.strategy_for(key);
        Some(RateLimitSnapshot {
            key: key.to_string(),
            strategy_id: e.strategy_id,
            capacity: strategy.capacity(),
            available: e.state.available(now),
            utilization_percent: e.state.utilization_percent(now),
            idle_ms: now.saturating_duration_since(e.last_used).as_millis() as u64,
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::strategies::RejectReason;

    fn token_limiter(capacity: f64, rate: f64) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new().with_default_strategy(StrategyConfig::token_bucket(capacity, rate)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_drain_and_refill() {
        let limiter = token_limiter(10.0, 1.0);
        assert!(limiter.consume("tenant-a", 10).unwrap().is_allowed());

        let denied = limiter.check("tenant-a", 1).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 1000);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("tenant-a", 1).unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_does_not_panic() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_default_strategy(StrategyConfig::fixed_window(2, Duration::ZERO)),
        );
        assert!(limiter.consume("k", 1).unwrap().is_allowed());
        assert!(limiter.consume("k", 1).unwrap().is_allowed());
        assert!(!limiter.consume("k", 1).unwrap().is_allowed());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.consume("k", 1).unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = token_limiter(1.0, 1.0);
        assert!(limiter.consume("a", 1).unwrap().is_allowed());
        assert!(!limiter.consume("a", 1).unwrap().is_allowed());
        assert!(limiter.consume("b", 1).unwrap().is_allowed());
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_strategy_selection_precedence() {
        let cfg = RateLimiterConfig::new()
            .with_prefix_strategy("tenant:", StrategyConfig::fixed_window(5, Duration::from_secs(1)))
            .with_prefix_strategy(
                "tenant:vip:",
                StrategyConfig::sliding_window(50, Duration::from_secs(1)),
            )
            .with_key_strategy("tenant:vip:acme", StrategyConfig::leaky_bucket(3.0, 1.0));

        assert_eq!(cfg.strategy_for("tenant:x").strategy_id(), "fixed_window");
        assert_eq!(cfg.strategy_for("tenant:vip:y").strategy_id(), "sliding_window");
        assert_eq!(cfg.strategy_for("tenant:vip:acme").strategy_id(), "leaky_bucket");
        assert_eq!(cfg.strategy_for("other").strategy_id(), "token_bucket");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_within_budget() {
        let limiter = token_limiter(1.0, 10.0);
        limiter.acquire("k", 1, Duration::from_millis(10)).await.unwrap();
        let start = Instant::now();
        limiter.acquire("k", 1, Duration::from_millis(500)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_past_deadline() {
        let limiter = token_limiter(1.0, 1.0);
        limiter.acquire("k", 1, Duration::ZERO).await.unwrap();
        let err = limiter
            .acquire("k", 1, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_cost_over_capacity_fails_without_hint() {
        let limiter = token_limiter(2.0, 1.0);
        assert_eq!(
            limiter.consume("k", 3).unwrap(),
            Admission::Rejected {
                reason: RejectReason::CostExceedsCapacity,
                retry_after: None
            }
        );
        let err = limiter.acquire("k", 3, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_evicted() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_idle_ttl(Duration::from_secs(5)));
        limiter.consume("old", 1).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        limiter.consume("fresh", 1).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.snapshot("old").is_none());
        assert!(limiter.snapshot("fresh").is_some());
    }

    #[tokio::test]
    async fn test_stats_track_rejections() {
        let limiter = token_limiter(2.0, 0.001);
        for _ in 0..4 {
            limiter.consume("k", 1).unwrap();
        }
        let stats = limiter.stats();
        assert_eq!(stats, LimiterStats { allowed: 2, rejected: 2 });
        assert!((stats.rejection_ratio() - 0.5).abs() < f64::EPSILON);

        let later = LimiterStats { allowed: 3, rejected: 6 };
        assert_eq!(later.since(&stats), LimiterStats { allowed: 1, rejected: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_utilization() {
        let limiter = token_limiter(4.0, 1.0);
        limiter.consume("k", 3).unwrap();
        let snap = limiter.snapshot("k").unwrap();
        assert_eq!(snap.strategy_id, "token_bucket");
        assert!((snap.utilization_percent - 75.0).abs() < 1e-6);
        assert!((snap.available - 1.0).abs() < 1e-6);
    }
}
