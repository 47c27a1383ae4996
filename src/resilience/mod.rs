//! 弹性模式模块：提供熔断器和多策略限流器。
//!
//! # Resilience Primitives Module
//!
//! Per-dependency failure isolation and per-key admission control.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed / Open / HalfOpen breaker for one dependency |
//! | [`registry`] | Named breakers, created lazily, shared by reference |
//! | [`rate_limiter`] | Per-key limiter with per-entry locking and idle eviction |
//! | [`strategies`] | Token bucket, leaky bucket, fixed and sliding window |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: calls pass; qualifying failures are counted
//! - **Open**: calls fail fast with [`Error::CircuitOpen`](crate::Error::CircuitOpen)
//! - **HalfOpen**: a bounded number of probes decide whether to close or re-open
//!
//! Only failure classes in the breaker's tripping set count; a business
//! rejection from a healthy dependency never opens a breaker.
//!
//! ```rust
//! use reliability_plane::resilience::{BreakerRegistry, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> reliability_plane::Result<()> {
//! let breakers = BreakerRegistry::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_recovery_timeout(Duration::from_secs(30)),
//! );
//! let answer = breakers.call("crm", || async { Ok(42) }).await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use reliability_plane::resilience::{RateLimiter, RateLimiterConfig, StrategyConfig};
//!
//! let limiter = RateLimiter::new(
//!     RateLimiterConfig::new().with_default_strategy(StrategyConfig::token_bucket(100.0, 10.0)),
//! );
//! let check = limiter.check("tenant-a", 1).unwrap();
//! assert!(check.allowed);
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;
pub mod strategies;

pub use circuit_breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, Permit,
};
pub use rate_limiter::{CheckResult, LimiterStats, RateLimitSnapshot, RateLimiter, RateLimiterConfig};
pub use registry::BreakerRegistry;
pub use strategies::{Admission, RejectReason, StrategyConfig};
