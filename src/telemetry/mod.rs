//! 遥测模块：日志初始化与控制面指标发布。
//!
//! Telemetry for the control plane.
//!
//! Logging goes through `tracing`; the library never installs a subscriber on
//! its own, binaries call [`init_tracing`]. Metrics go through the `metrics`
//! facade, so whichever exporter the host process installs receives them. With
//! no recorder installed every call here is a cheap no-op.
//!
//! ## Emitted metrics
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `breaker_state` | gauge (0 closed, 1 open, 2 half-open) | `breaker` |
//! | `breaker_failure_count` | gauge | `breaker` |
//! | `limiter_utilization_percent` | gauge | `key` |
//! | `queue_size` / `queue_max_size` | gauge | |
//! | `active_workers` | gauge | |
//! | `degradation_level` | gauge (0 full … 3 maintenance) | |
//! | `fallback_outcome_total` | counter | `feature`, `outcome` |
//! | `approval_pending_count` | gauge | |
//! | `approval_timeout_count` | counter | |

use crate::degradation::DegradationLevel;
use crate::resilience::BreakerState;
use crate::{Error, ErrorContext, Result};
use tracing_subscriber::EnvFilter;

/// Metric names.
pub mod names {
    pub const BREAKER_STATE: &str = "breaker_state";
    pub const BREAKER_FAILURE_COUNT: &str = "breaker_failure_count";
    pub const LIMITER_UTILIZATION_PERCENT: &str = "limiter_utilization_percent";
    pub const QUEUE_SIZE: &str = "queue_size";
    pub const QUEUE_MAX_SIZE: &str = "queue_max_size";
    pub const ACTIVE_WORKERS: &str = "active_workers";
    pub const DEGRADATION_LEVEL: &str = "degradation_level";
    pub const FALLBACK_OUTCOME_TOTAL: &str = "fallback_outcome_total";
    pub const APPROVAL_PENDING_COUNT: &str = "approval_pending_count";
    pub const APPROVAL_TIMEOUT_COUNT: &str = "approval_timeout_count";
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Fails if a global subscriber is already set.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| {
            Error::runtime_with_context(
                format!("failed to install tracing subscriber: {}", e),
                ErrorContext::new().with_source("telemetry"),
            )
        })
}

pub(crate) fn record_breaker_state(name: &str, state: BreakerState) {
    metrics::gauge!(names::BREAKER_STATE, "breaker" => name.to_string()).set(state.gauge_value());
}

pub(crate) fn record_breaker_failures(name: &str, failures: u32) {
    metrics::gauge!(names::BREAKER_FAILURE_COUNT, "breaker" => name.to_string())
        .set(failures as f64);
}

pub(crate) fn record_limiter_utilization(key: &str, percent: f64) {
    metrics::gauge!(names::LIMITER_UTILIZATION_PERCENT, "key" => key.to_string()).set(percent);
}

pub(crate) fn record_queue(size: usize, max_size: usize) {
    metrics::gauge!(names::QUEUE_SIZE).set(size as f64);
    metrics::gauge!(names::QUEUE_MAX_SIZE).set(max_size as f64);
}

pub(crate) fn record_active_workers(count: usize) {
    metrics::gauge!(names::ACTIVE_WORKERS).set(count as f64);
}

pub(crate) fn record_degradation_level(level: DegradationLevel) {
    metrics::gauge!(names::DEGRADATION_LEVEL).set(level.severity() as f64);
}

pub(crate) fn record_fallback_outcome(feature: &str, outcome: &'static str) {
    metrics::counter!(
        names::FALLBACK_OUTCOME_TOTAL,
        "feature" => feature.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub(crate) fn record_approval_pending(count: usize) {
    metrics::gauge!(names::APPROVAL_PENDING_COUNT).set(count as f64);
}

pub(crate) fn record_approval_timeout() {
    metrics::counter!(names::APPROVAL_TIMEOUT_COUNT).increment(1);
}
