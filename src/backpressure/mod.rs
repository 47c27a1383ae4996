//! 背压模块：汇总限流、队列、工作池与熔断信号，计算过载分数并驱动降级。
//!
//! # Backpressure Module
//!
//! Samples the other reliability components on a fixed tick, combines them
//! into an overload score and emits degrade / restore signals with hysteresis.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`OverloadDetector`] | Score thresholds, sustain durations, one degrade per episode |
//! | [`BackpressureCoordinator`] | Sampling loop feeding the degradation manager |
//! | [`LoadSource`] | Queue utilization and worker saturation of a pool |
//!
//! ## Score
//!
//! `score = w_r·rejection_ratio + w_q·queue_utilization + w_w·worker_saturation + w_b·open_breaker_ratio`
//!
//! with weights normalized to sum to 1 (defaults 0.3 / 0.3 / 0.2 / 0.2). A
//! degrade fires after the score stays above the rising threshold for the
//! rising sustain; a restore fires after it stays below the (lower) falling
//! threshold for the falling sustain.

pub mod coordinator;
pub mod detector;

pub use coordinator::{BackpressureConfig, BackpressureCoordinator, BackpressureSnapshot, LoadSource};
pub use detector::{DetectorConfig, LoadInputs, OverloadDetector, ScoreWeights};
