//! 配置模块：加载并校验控制面配置（YAML / JSON）。
//!
//! # Configuration
//!
//! [`ReliabilityConfig`] is the serde form of every component's settings.
//! Durations are integer milliseconds (`*_ms`). Every section defaults, so an
//! empty document is a valid config.
//!
//! ```yaml
//! breaker:
//!   failure_threshold: 5
//!   recovery_timeout_ms: 30000
//!   overrides:
//!     crm:
//!       failure_threshold: 3
//! limiter:
//!   default: { strategy: token_bucket, capacity: 10, refill_rate: 1 }
//!   prefixes:
//!     "tenant:": { strategy: sliding_window, limit: 100, window_ms: 60000 }
//! queue:
//!   max_size: 500
//!   min_workers: 2
//!   max_workers: 16
//! backpressure:
//!   rising_threshold: 0.75
//!   falling_threshold: 0.5
//! approval:
//!   default_timeout_ms: 300000
//! degradation:
//!   features:
//!     recommendations:
//!       available_until: full
//!       fallback: { kind: static, value: [] }
//! ```

use crate::approval::ApprovalConfig;
use crate::backpressure::{BackpressureConfig, DetectorConfig, ScoreWeights};
use crate::degradation::{DegradationLevel, FallbackStrategy, FeatureSpec};
use crate::error_code::FailureClass;
use crate::queue::{FullPolicy, PoolConfig, QueueConfig};
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, StrategyConfig};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the config file for the binary.
pub const CONFIG_ENV: &str = "RELIABILITY_CONFIG";

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("config_validator"),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub breaker: BreakerSection,
    pub limiter: LimiterSection,
    pub queue: QueueSection,
    pub backpressure: BackpressureSection,
    pub approval: ApprovalSection,
    pub degradation: DegradationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_success_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_window_ms: Option<u64>,
    pub tripping_classes: Vec<FailureClass>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let d = CircuitBreakerConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            recovery_timeout_ms: d.recovery_timeout.as_millis() as u64,
            half_open_max_calls: d.half_open_max_calls,
            half_open_success_threshold: None,
            failure_window_ms: None,
            tripping_classes: d.tripping_classes,
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        let mut cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_recovery_timeout(ms(self.recovery_timeout_ms))
            .with_half_open_max_calls(self.half_open_max_calls)
            .with_tripping_classes(self.tripping_classes.clone());
        if let Some(n) = self.half_open_success_threshold {
            cfg = cfg.with_half_open_success_threshold(n);
        }
        if let Some(w) = self.failure_window_ms {
            cfg = cfg.with_failure_window(ms(w));
        }
        cfg
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid(format!("{prefix}.failure_threshold"), "must be greater than zero"));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(invalid(format!("{prefix}.recovery_timeout_ms"), "must be greater than zero"));
        }
        if self.half_open_max_calls == 0 {
            return Err(invalid(format!("{prefix}.half_open_max_calls"), "must be greater than zero"));
        }
        if let Some(n) = self.half_open_success_threshold {
            if n == 0 || n > self.half_open_max_calls {
                return Err(invalid(
                    format!("{prefix}.half_open_success_threshold"),
                    "must be between 1 and half_open_max_calls",
                ));
            }
        }
        if self.failure_window_ms == Some(0) {
            return Err(invalid(format!("{prefix}.failure_window_ms"), "must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    #[serde(flatten)]
    pub defaults: BreakerSettings,
    /// Per-dependency settings, keyed by breaker name.
    pub overrides: BTreeMap<String, BreakerSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSection {
    pub default: StrategyConfig,
    pub keys: BTreeMap<String, StrategyConfig>,
    pub prefixes: BTreeMap<String, StrategyConfig>,
    pub idle_ttl_ms: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        Self {
            default: StrategyConfig::default(),
            keys: BTreeMap::new(),
            prefixes: BTreeMap::new(),
            idle_ttl_ms: RateLimiterConfig::default().idle_ttl.as_millis() as u64,
        }
    }
}

impl LimiterSection {
    pub fn to_config(&self) -> RateLimiterConfig {
        let mut cfg = RateLimiterConfig::new()
            .with_default_strategy(self.default.clone())
            .with_idle_ttl(ms(self.idle_ttl_ms));
        for (key, s) in &self.keys {
            cfg = cfg.with_key_strategy(key.clone(), s.clone());
        }
        for (prefix, s) in &self.prefixes {
            cfg = cfg.with_prefix_strategy(prefix.clone(), s.clone());
        }
        cfg
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_size: usize,
    pub full_policy: FullPolicy,
    pub block_timeout_ms: u64,
    pub default_task_timeout_ms: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub scale_sustain_ms: u64,
    pub sample_interval_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        let q = QueueConfig::default();
        let p = PoolConfig::default();
        Self {
            max_size: q.max_size,
            full_policy: q.full_policy,
            block_timeout_ms: q.block_timeout.as_millis() as u64,
            default_task_timeout_ms: q.default_task_timeout.as_millis() as u64,
            min_workers: p.min_workers,
            max_workers: p.max_workers,
            high_watermark: p.high_watermark,
            low_watermark: p.low_watermark,
            scale_sustain_ms: p.scale_sustain.as_millis() as u64,
            sample_interval_ms: p.sample_interval.as_millis() as u64,
            max_attempts: p.max_attempts,
            base_backoff_ms: p.base_backoff.as_millis() as u64,
            max_backoff_ms: p.max_backoff.as_millis() as u64,
        }
    }
}

impl QueueSection {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig::new()
            .with_max_size(self.max_size)
            .with_full_policy(self.full_policy)
            .with_block_timeout(ms(self.block_timeout_ms))
            .with_default_task_timeout(ms(self.default_task_timeout_ms))
    }

    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .with_workers(self.min_workers, self.max_workers)
            .with_watermarks(self.low_watermark, self.high_watermark)
            .with_scale_sustain(ms(self.scale_sustain_ms))
            .with_sample_interval(ms(self.sample_interval_ms))
            .with_max_attempts(self.max_attempts)
            .with_backoff(ms(self.base_backoff_ms), ms(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureSection {
    pub tick_interval_ms: u64,
    pub rising_threshold: f64,
    pub falling_threshold: f64,
    pub rising_sustain_ms: u64,
    pub falling_sustain_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_interval_ms: Option<u64>,
    pub weights: ScoreWeights,
}

impl Default for BackpressureSection {
    fn default() -> Self {
        let b = BackpressureConfig::default();
        Self {
            tick_interval_ms: b.tick_interval.as_millis() as u64,
            rising_threshold: b.detector.rising_threshold,
            falling_threshold: b.detector.falling_threshold,
            rising_sustain_ms: b.detector.rising_sustain.as_millis() as u64,
            falling_sustain_ms: b.detector.falling_sustain.as_millis() as u64,
            escalation_interval_ms: None,
            weights: ScoreWeights::default(),
        }
    }
}

impl BackpressureSection {
    pub fn to_config(&self) -> BackpressureConfig {
        BackpressureConfig {
            tick_interval: ms(self.tick_interval_ms),
            detector: DetectorConfig {
                rising_threshold: self.rising_threshold,
                falling_threshold: self.falling_threshold,
                rising_sustain: ms(self.rising_sustain_ms),
                falling_sustain: ms(self.falling_sustain_ms),
                escalation_interval: self.escalation_interval_ms.map(ms),
                weights: self.weights,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub default_timeout_ms: u64,
    pub max_pending: usize,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        let a = ApprovalConfig::default();
        Self {
            default_timeout_ms: a.default_timeout.as_millis() as u64,
            max_pending: a.max_pending,
        }
    }
}

impl ApprovalSection {
    pub fn to_config(&self) -> ApprovalConfig {
        ApprovalConfig::new()
            .with_default_timeout(ms(self.default_timeout_ms))
            .with_max_pending(self.max_pending)
    }
}

/// Config form of a fallback. `Service` fallbacks are code, not config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackSection {
    Cached { ttl_ms: u64 },
    Static { value: Value },
}

impl FallbackSection {
    pub fn to_strategy(&self) -> FallbackStrategy {
        match self {
            FallbackSection::Cached { ttl_ms } => FallbackStrategy::cached(ms(*ttl_ms)),
            FallbackSection::Static { value } => FallbackStrategy::Static(value.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSection {
    pub available_until: DegradationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackSection>,
}

impl FeatureSection {
    pub fn to_spec(&self) -> FeatureSpec {
        let spec = FeatureSpec::new(self.available_until);
        match &self.fallback {
            Some(fb) => spec.with_fallback(fb.to_strategy()),
            None => spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationSection {
    /// Capacity of the last-known-good cache.
    pub cache_max_entries: usize,
    pub features: BTreeMap<String, FeatureSection>,
}

impl Default for DegradationSection {
    fn default() -> Self {
        Self {
            cache_max_entries: 1024,
            features: BTreeMap::new(),
        }
    }
}

impl ReliabilityConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read and parse a file; `.json` is JSON, `.yaml` / `.yml` is YAML.
    /// Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if extension.eq_ignore_ascii_case("json") {
            Self::from_json_str(&content)
        } else if extension.eq_ignore_ascii_case("yaml") || extension.eq_ignore_ascii_case("yml") {
            Self::from_yaml_str(&content)
        } else {
            Err(Error::configuration_with_context(
                format!("unsupported config file extension '{}'", extension),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_details("expected .json, .yaml or .yml")
                    .with_source("config_loader"),
            ))
        }
    }

    /// Read, parse and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let cfg = Self::from_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every numeric invariant; the error names the offending field.
    pub fn validate(&self) -> Result<()> {
        self.breaker.defaults.validate("breaker")?;
        for (name, settings) in &self.breaker.overrides {
            settings.validate(&format!("breaker.overrides.{name}"))?;
        }

        let l = &self.limiter;
        if let Some(reason) = l.default.invalid_reason() {
            return Err(invalid("limiter.default", reason));
        }
        for (key, s) in &l.keys {
            if let Some(reason) = s.invalid_reason() {
                return Err(invalid(format!("limiter.keys.{key}"), reason));
            }
        }
        for (prefix, s) in &l.prefixes {
            if let Some(reason) = s.invalid_reason() {
                return Err(invalid(format!("limiter.prefixes.{prefix}"), reason));
            }
        }
        if l.idle_ttl_ms == 0 {
            return Err(invalid("limiter.idle_ttl_ms", "must be greater than zero"));
        }

        let q = &self.queue;
        if q.max_size == 0 {
            return Err(invalid("queue.max_size", "must be greater than zero"));
        }
        if q.max_workers == 0 {
            return Err(invalid("queue.max_workers", "must be greater than zero"));
        }
        if q.min_workers == 0 {
            return Err(invalid("queue.min_workers", "must be at least 1"));
        }
        if q.min_workers > q.max_workers {
            return Err(invalid("queue.min_workers", "must not exceed max_workers"));
        }
        if !(0.0..=1.0).contains(&q.low_watermark) {
            return Err(invalid("queue.low_watermark", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&q.high_watermark) {
            return Err(invalid("queue.high_watermark", "must be within [0, 1]"));
        }
        if q.low_watermark >= q.high_watermark {
            return Err(invalid("queue.low_watermark", "must be below high_watermark"));
        }
        if q.max_attempts == 0 {
            return Err(invalid("queue.max_attempts", "must be at least 1"));
        }
        if q.base_backoff_ms > q.max_backoff_ms {
            return Err(invalid("queue.base_backoff_ms", "must not exceed max_backoff_ms"));
        }
        for (field, value) in [
            ("queue.default_task_timeout_ms", q.default_task_timeout_ms),
            ("queue.sample_interval_ms", q.sample_interval_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        let b = &self.backpressure;
        if b.tick_interval_ms == 0 {
            return Err(invalid("backpressure.tick_interval_ms", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&b.rising_threshold) {
            return Err(invalid("backpressure.rising_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&b.falling_threshold) {
            return Err(invalid("backpressure.falling_threshold", "must be within [0, 1]"));
        }
        if b.falling_threshold >= b.rising_threshold {
            return Err(invalid(
                "backpressure.falling_threshold",
                "must be below rising_threshold",
            ));
        }
        if b.escalation_interval_ms == Some(0) {
            return Err(invalid("backpressure.escalation_interval_ms", "must be greater than zero"));
        }
        let w = &b.weights;
        for (field, value) in [
            ("backpressure.weights.rejection", w.rejection),
            ("backpressure.weights.queue", w.queue),
            ("backpressure.weights.workers", w.workers),
            ("backpressure.weights.breakers", w.breakers),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, "must be a non-negative number"));
            }
        }
        if w.sum() <= 0.0 {
            return Err(invalid("backpressure.weights", "must have a positive sum"));
        }

        if self.approval.default_timeout_ms == 0 {
            return Err(invalid("approval.default_timeout_ms", "must be greater than zero"));
        }
        if self.approval.max_pending == 0 {
            return Err(invalid("approval.max_pending", "must be greater than zero"));
        }

        if self.degradation.cache_max_entries == 0 {
            return Err(invalid("degradation.cache_max_entries", "must be greater than zero"));
        }
        for (name, feature) in &self.degradation.features {
            if let Some(FallbackSection::Cached { ttl_ms: 0 }) = feature.fallback {
                return Err(invalid(
                    format!("degradation.features.{name}.fallback.ttl_ms"),
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}
