//! # reliability-plane
//!
//! 可靠性控制面：为依赖调用、任务处理与人工审批提供熔断、限流、排队、背压与降级保护。
//!
//! Reliability control plane for services that call unreliable dependencies,
//! process queued work and wait on human sign-off.
//!
//! ## Overview
//!
//! Requests are admitted by the [`resilience::RateLimiter`], dependency calls
//! are guarded by per-dependency circuit breakers, background work flows through
//! a bounded priority [`queue::TaskQueue`] drained by a scalable
//! [`queue::WorkerPool`]. The [`backpressure::BackpressureCoordinator`] samples
//! limiter, queue, worker and breaker load into one overload score and drives
//! the [`degradation::DegradationManager`], which disables features and serves
//! fallbacks as the service level drops. The [`approval::ApprovalGate`] parks a
//! decision until a human responds or its timeout fires.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reliability_plane::{ReliabilityConfig, ReliabilityPlane};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> reliability_plane::Result<()> {
//!     let plane = ReliabilityPlane::from_config(ReliabilityConfig::load("reliability.yaml")?)?;
//!     plane.start()?;
//!
//!     if plane.check("tenant-a", 1)?.allowed {
//!         let profile = plane
//!             .execute_with_fallback("profile", || async { Ok(json!({"name": "ada"})) }, None)
//!             .await?;
//!         println!("{profile}");
//!     }
//!
//!     plane.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Circuit breakers and the multi-strategy rate limiter |
//! | [`queue`] | Bounded priority queue, worker pool, dead letters |
//! | [`backpressure`] | Overload score, hysteresis detector, sampling loop |
//! | [`degradation`] | Service levels, feature gating, fallbacks |
//! | [`approval`] | Human-in-the-loop approval gate and respond endpoint |
//! | [`cache`] | Last-known-good value cache used by cached fallbacks |
//! | [`config`] | YAML / JSON configuration and validation |
//! | [`plane`] | Composition root owning every component |
//! | [`telemetry`] | Tracing setup and metric emission |

pub mod approval;
pub mod backpressure;
pub mod cache;
pub mod config;
pub mod degradation;
pub mod error_code;
pub mod plane;
pub mod queue;
pub mod resilience;
pub mod telemetry;

// Re-export main types for convenience
pub use config::ReliabilityConfig;
pub use error_code::FailureClass;
pub use plane::{ReliabilityPlane, ReliabilityPlaneBuilder};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
