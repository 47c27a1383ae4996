//! Admission algorithms behind [`RateLimiter`](super::rate_limiter::RateLimiter).
//!
//! Each strategy is a plain state machine driven by an explicit `now`, so the
//! limiter owns all clock reads and locking.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Algorithm and parameters for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// `capacity` tokens, refilled at `refill_rate` tokens per second.
    TokenBucket { capacity: f64, refill_rate: f64 },
    /// Queue of `queue_capacity` units draining at `leak_rate` units per second.
    LeakyBucket { queue_capacity: f64, leak_rate: f64 },
    /// At most `limit` units per aligned window.
    ///
    /// Up to 2x `limit` can pass across a window boundary.
    FixedWindow { limit: u64, window_ms: u64 },
    /// At most `limit` units per rolling window, estimated from the current and
    /// previous window counts.
    SlidingWindow { limit: u64, window_ms: u64 },
}

impl StrategyConfig {
    pub fn token_bucket(capacity: f64, refill_rate: f64) -> Self {
        Self::TokenBucket {
            capacity,
            refill_rate,
        }
    }

    pub fn leaky_bucket(queue_capacity: f64, leak_rate: f64) -> Self {
        Self::LeakyBucket {
            queue_capacity,
            leak_rate,
        }
    }

    pub fn fixed_window(limit: u64, window: Duration) -> Self {
        Self::FixedWindow {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn sliding_window(limit: u64, window: Duration) -> Self {
        Self::SlidingWindow {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    /// Stable identifier used in logs and snapshots.
    pub fn strategy_id(&self) -> &'static str {
        match self {
            Self::TokenBucket { .. } => "token_bucket",
            Self::LeakyBucket { .. } => "leaky_bucket",
            Self::FixedWindow { .. } => "fixed_window",
            Self::SlidingWindow { .. } => "sliding_window",
        }
    }

    /// Largest single cost the strategy can ever admit.
    pub fn capacity(&self) -> f64 {
        match self {
            Self::TokenBucket { capacity, .. } => *capacity,
            Self::LeakyBucket { queue_capacity, .. } => *queue_capacity,
            Self::FixedWindow { limit, .. } | Self::SlidingWindow { limit, .. } => *limit as f64,
        }
    }

    /// Returns a description of the first invalid parameter, if any.
    pub fn invalid_reason(&self) -> Option<&'static str> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        match self {
            Self::TokenBucket {
                capacity,
                refill_rate,
            } => {
                if !positive(*capacity) {
                    Some("capacity must be a positive number")
                } else if !positive(*refill_rate) {
                    Some("refill_rate must be a positive number")
                } else {
                    None
                }
            }
            Self::LeakyBucket {
                queue_capacity,
                leak_rate,
            } => {
                if !positive(*queue_capacity) {
                    Some("queue_capacity must be a positive number")
                } else if !positive(*leak_rate) {
                    Some("leak_rate must be a positive number")
                } else {
                    None
                }
            }
            Self::FixedWindow { limit, window_ms } | Self::SlidingWindow { limit, window_ms } => {
                if *limit == 0 {
                    Some("limit must be greater than zero")
                } else if *window_ms == 0 {
                    Some("window_ms must be greater than zero")
                } else {
                    None
                }
            }
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::token_bucket(10.0, 1.0)
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Quota exhausted for now; retry after the hint.
    QuotaExhausted,
    /// Smoothing queue is full.
    QueueFull,
    /// Cost is larger than the strategy could ever admit.
    CostExceedsCapacity,
}

/// Admission decision; never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected {
        reason: RejectReason,
        retry_after: Option<Duration>,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Allowed => None,
            Admission::Rejected { retry_after, .. } => *retry_after,
        }
    }

    fn quota(wait_secs: f64) -> Self {
        Admission::Rejected {
            reason: RejectReason::QuotaExhausted,
            retry_after: Some(secs(wait_secs)),
        }
    }
}

fn secs(s: f64) -> Duration {
    if s.is_finite() && s > 0.0 {
        Duration::from_secs_f64(s)
    } else {
        Duration::ZERO
    }
}

/// Windows shorter than 1ms are treated as 1ms.
fn window_of(window_ms: u64) -> Duration {
    Duration::from_millis(window_ms.max(1))
}

/// Start of the window containing `now`, given the time elapsed since an
/// earlier aligned start. `window` must be non-zero.
fn align(now: Instant, elapsed: Duration, window: Duration) -> Instant {
    let into_window = elapsed.as_nanos() % window.as_nanos();
    now - Duration::from_nanos(into_window as u64)
}

/// Mutable per-key algorithm state.
#[derive(Debug, Clone)]
pub(crate) enum StrategyState {
    TokenBucket {
        capacity: f64,
        refill_rate: f64,
        tokens: f64,
        last: Instant,
    },
    LeakyBucket {
        queue_capacity: f64,
        leak_rate: f64,
        level: f64,
        last: Instant,
    },
    FixedWindow {
        limit: f64,
        window: Duration,
        window_start: Instant,
        count: f64,
    },
    SlidingWindow {
        limit: f64,
        window: Duration,
        window_start: Instant,
        current: f64,
        previous: f64,
    },
}

impl StrategyState {
    pub(crate) fn new(cfg: &StrategyConfig, now: Instant) -> Self {
        match cfg {
            StrategyConfig::TokenBucket {
                capacity,
                refill_rate,
            } => Self::TokenBucket {
                capacity: *capacity,
                refill_rate: *refill_rate,
                tokens: *capacity,
                last: now,
            },
            StrategyConfig::LeakyBucket {
                queue_capacity,
                leak_rate,
            } => Self::LeakyBucket {
                queue_capacity: *queue_capacity,
                leak_rate: *leak_rate,
                level: 0.0,
                last: now,
            },
            StrategyConfig::FixedWindow { limit, window_ms } => Self::FixedWindow {
                limit: *limit as f64,
                window: window_of(*window_ms),
                window_start: now,
                count: 0.0,
            },
            StrategyConfig::SlidingWindow { limit, window_ms } => Self::SlidingWindow {
                limit: *limit as f64,
                window: window_of(*window_ms),
                window_start: now,
                current: 0.0,
                previous: 0.0,
            },
        }
    }

    fn capacity(&self) -> f64 {
        match self {
            Self::TokenBucket { capacity, .. } => *capacity,
            Self::LeakyBucket { queue_capacity, .. } => *queue_capacity,
            Self::FixedWindow { limit, .. } | Self::SlidingWindow { limit, .. } => *limit,
        }
    }

    /// Bring time-dependent state up to `now`.
    fn advance(&mut self, now: Instant) {
        match self {
            Self::TokenBucket {
                capacity,
                refill_rate,
                tokens,
                last,
            } => {
                let elapsed = now.saturating_duration_since(*last).as_secs_f64();
                if elapsed > 0.0 {
                    *tokens = (*tokens + elapsed * *refill_rate).min(*capacity);
                    *last = now;
                }
            }
            Self::LeakyBucket {
                leak_rate,
                level,
                last,
                ..
            } => {
                let elapsed = now.saturating_duration_since(*last).as_secs_f64();
                if elapsed > 0.0 {
                    *level = (*level - elapsed * *leak_rate).max(0.0);
                    *last = now;
                }
            }
            Self::FixedWindow {
                window,
                window_start,
                count,
                ..
            } => {
                let elapsed = now.saturating_duration_since(*window_start);
                if elapsed >= *window {
                    *window_start = align(now, elapsed, *window);
                    *count = 0.0;
                }
            }
            Self::SlidingWindow {
                window,
                window_start,
                current,
                previous,
                ..
            } => {
                let elapsed = now.saturating_duration_since(*window_start);
                if elapsed >= *window {
                    *previous = if elapsed < *window * 2 { *current } else { 0.0 };
                    *current = 0.0;
                    *window_start = align(now, elapsed, *window);
                }
            }
        }
    }

    /// Try to take `cost` units at `now`.
    pub(crate) fn try_consume(&mut self, cost: f64, now: Instant) -> Admission {
        if cost > self.capacity() {
            return Admission::Rejected {
                reason: RejectReason::CostExceedsCapacity,
                retry_after: None,
            };
        }
        self.advance(now);
        match self {
            Self::TokenBucket {
                refill_rate,
                tokens,
                ..
            } => {
                if *tokens >= cost {
                    *tokens -= cost;
                    Admission::Allowed
                } else {
                    Admission::quota((cost - *tokens) / *refill_rate)
                }
            }
            Self::LeakyBucket {
                queue_capacity,
                leak_rate,
                level,
                ..
            } => {
                if *level + cost <= *queue_capacity {
                    *level += cost;
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        reason: RejectReason::QueueFull,
                        retry_after: Some(secs((*level + cost - *queue_capacity) / *leak_rate)),
                    }
                }
            }
            Self::FixedWindow {
                limit,
                window,
                window_start,
                count,
            } => {
                if *count + cost <= *limit {
                    *count += cost;
                    Admission::Allowed
                } else {
                    let window_end = *window_start + *window;
                    Admission::Rejected {
                        reason: RejectReason::QuotaExhausted,
                        retry_after: Some(window_end.saturating_duration_since(now)),
                    }
                }
            }
            Self::SlidingWindow {
                limit,
                window,
                window_start,
                current,
                previous,
            } => {
                let w = window.as_secs_f64();
                let elapsed = now.saturating_duration_since(*window_start).as_secs_f64();
                let weight = 1.0 - elapsed / w;
                let estimate = *previous * weight + *current;
                if estimate + cost <= *limit {
                    *current += cost;
                    return Admission::Allowed;
                }
                // Wait until the previous window's share has decayed enough, or
                // failing that, until the current window has rolled over.
                let headroom = *limit - *current - cost;
                let wait = if headroom >= 0.0 && *previous > 0.0 {
                    w * (1.0 - headroom / *previous) - elapsed
                } else if *current > 0.0 {
                    let into_next = w * (1.0 - (*limit - cost) / *current).max(0.0);
                    (w - elapsed) + into_next
                } else {
                    w - elapsed
                };
                Admission::quota(wait)
            }
        }
    }

    /// Share of capacity in use, 0–100.
    pub(crate) fn utilization_percent(&mut self, now: Instant) -> f64 {
        self.advance(now);
        let used = match self {
            Self::TokenBucket {
                capacity, tokens, ..
            } => 1.0 - *tokens / *capacity,
            Self::LeakyBucket {
                queue_capacity,
                level,
                ..
            } => *level / *queue_capacity,
            Self::FixedWindow { limit, count, .. } => *count / *limit,
            Self::SlidingWindow {
                limit,
                window,
                window_start,
                current,
                previous,
            } => {
                let elapsed = now.saturating_duration_since(*window_start).as_secs_f64();
                let weight = 1.0 - elapsed / window.as_secs_f64();
                (*previous * weight + *current) / *limit
            }
        };
        (used * 100.0).clamp(0.0, 100.0)
    }

    /// Remaining units (tokens, queue room or window quota).
    pub(crate) fn available(&mut self, now: Instant) -> f64 {
        let capacity = self.capacity();
        capacity * (1.0 - self.utilization_percent(now) / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_token_bucket_retry_after() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::token_bucket(10.0, 1.0), t0);
        assert!(st.try_consume(10.0, t0).is_allowed());

        let denied = st.try_consume(1.0, t0);
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(1)));

        assert!(st.try_consume(1.0, t0 + Duration::from_secs(1)).is_allowed());
    }

    #[test]
    fn test_token_bucket_caps_refill() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::token_bucket(5.0, 100.0), t0);
        let later = t0 + Duration::from_secs(60);
        assert!((st.available(later) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_above_capacity_never_admitted() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::fixed_window(3, ms(1000)), t0);
        assert_eq!(
            st.try_consume(4.0, t0),
            Admission::Rejected {
                reason: RejectReason::CostExceedsCapacity,
                retry_after: None
            }
        );
    }

    #[test]
    fn test_leaky_bucket_rejects_instead_of_bursting() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::leaky_bucket(3.0, 1.0), t0);
        for _ in 0..3 {
            assert!(st.try_consume(1.0, t0).is_allowed());
        }
        match st.try_consume(1.0, t0) {
            Admission::Rejected {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, RejectReason::QueueFull);
                assert_eq!(retry_after, Some(Duration::from_secs(1)));
            }
            Admission::Allowed => panic!("leaky bucket should be full"),
        }
        // One unit drains per second.
        assert!(st.try_consume(1.0, t0 + ms(1000)).is_allowed());
        assert!(!st.try_consume(1.0, t0 + ms(1000)).is_allowed());
    }

    #[test]
    fn test_fixed_window_allows_double_burst_at_boundary() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::fixed_window(5, ms(1000)), t0);
        let edge = t0 + ms(999);
        for _ in 0..5 {
            assert!(st.try_consume(1.0, edge).is_allowed());
        }
        let denied = st.try_consume(1.0, edge);
        assert_eq!(denied.retry_after(), Some(ms(1)));

        let next = t0 + ms(1000);
        for _ in 0..5 {
            assert!(st.try_consume(1.0, next).is_allowed());
        }
    }

    #[test]
    fn test_sliding_window_smooths_boundary() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::sliding_window(10, ms(1000)), t0);
        for _ in 0..10 {
            assert!(st.try_consume(1.0, t0 + ms(900)).is_allowed());
        }
        // Just after the boundary the previous window still weighs ~90%.
        let just_after = t0 + ms(1100);
        assert!(st.try_consume(1.0, just_after).is_allowed());
        assert!(!st.try_consume(1.0, just_after).is_allowed());

        // Halfway through, half the previous window has decayed.
        let halfway = t0 + ms(1500);
        let mut admitted = 0;
        while st.try_consume(1.0, halfway).is_allowed() {
            admitted += 1;
        }
        assert_eq!(admitted, 4);
    }

    #[test]
    fn test_sliding_window_retry_after_points_at_decay() {
        let t0 = Instant::now();
        let mut st = StrategyState::new(&StrategyConfig::sliding_window(4, ms(1000)), t0);
        for _ in 0..4 {
            assert!(st.try_consume(1.0, t0).is_allowed());
        }
        let at = t0 + ms(1000);
        // previous=4 at full weight; a quarter must decay before one more fits.
        let wait = st.try_consume(1.0, at).retry_after().unwrap();
        assert_eq!(wait, ms(250));
        assert!(st.try_consume(1.0, at + ms(251)).is_allowed());
    }

    #[test]
    fn test_windows_realign_after_long_idle() {
        let t0 = Instant::now();
        // more elapsed windows than fit in a u32
        let later = t0 + Duration::from_secs(60 * 24 * 3600) + ms(3);
        for cfg in [
            StrategyConfig::fixed_window(2, ms(1)),
            StrategyConfig::sliding_window(2, ms(1)),
        ] {
            let mut st = StrategyState::new(&cfg, t0);
            assert!(st.try_consume(2.0, t0).is_allowed());
            assert!(st.try_consume(2.0, later).is_allowed());
            assert!(!st.try_consume(1.0, later).is_allowed(), "{}", cfg.strategy_id());
        }
    }

    #[test]
    fn test_invalid_parameters_reported() {
        assert!(StrategyConfig::token_bucket(0.0, 1.0).invalid_reason().is_some());
        assert!(StrategyConfig::leaky_bucket(1.0, f64::NAN).invalid_reason().is_some());
        assert!(StrategyConfig::sliding_window(1, ms(0)).invalid_reason().is_some());
        assert!(StrategyConfig::default().invalid_reason().is_none());
    }

    #[test]
    fn test_strategy_config_serde_tag() {
        let cfg: StrategyConfig =
            serde_json::from_str(r#"{"strategy":"fixed_window","limit":100,"window_ms":60000}"#)
                .unwrap();
        assert_eq!(cfg, StrategyConfig::fixed_window(100, Duration::from_secs(60)));
        assert_eq!(cfg.strategy_id(), "fixed_window");
    }
}
