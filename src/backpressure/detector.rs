//! Overload score and hysteresis detector.

use crate::degradation::Signal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Sampled load, each input in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadInputs {
    /// Limiter rejections / decisions since the previous tick.
    pub rejection_ratio: f64,
    pub queue_utilization: f64,
    pub worker_saturation: f64,
    /// Open breakers / known breakers.
    pub breaker_open_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub rejection: f64,
    pub queue: f64,
    pub workers: f64,
    pub breakers: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            rejection: 0.3,
            queue: 0.3,
            workers: 0.2,
            breakers: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.rejection + self.queue + self.workers + self.breakers
    }

    /// Scaled to sum to 1. Returns the defaults for a non-positive sum.
    pub fn normalized(&self) -> Self {
        let sum = self.sum();
        if sum <= 0.0 || !sum.is_finite() {
            return Self::default();
        }
        Self {
            rejection: self.rejection / sum,
            queue: self.queue / sum,
            workers: self.workers / sum,
            breakers: self.breakers / sum,
        }
    }

    /// Weighted sum of the clamped inputs; expects normalized weights.
    pub fn score(&self, inputs: &LoadInputs) -> f64 {
        let c = |v: f64| v.clamp(0.0, 1.0);
        self.rejection * c(inputs.rejection_ratio)
            + self.queue * c(inputs.queue_utilization)
            + self.workers * c(inputs.worker_saturation)
            + self.breakers * c(inputs.breaker_open_ratio)
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub rising_threshold: f64,
    pub falling_threshold: f64,
    pub rising_sustain: Duration,
    pub falling_sustain: Duration,
    /// Emit a further degrade for every additional interval held above the
    /// rising threshold.
    pub escalation_interval: Option<Duration>,
    pub weights: ScoreWeights,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rising_threshold: 0.75,
            falling_threshold: 0.5,
            rising_sustain: Duration::from_secs(5),
            falling_sustain: Duration::from_secs(15),
            escalation_interval: None,
            weights: ScoreWeights::default(),
        }
    }
}

/// Turns a stream of scores into degrade/restore signals.
///
/// One degrade per overload episode (plus escalations, when configured); each
/// restore undoes one outstanding degrade, so restores never outnumber them.
#[derive(Debug)]
pub struct OverloadDetector {
    cfg: DetectorConfig,
    weights: ScoreWeights,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    last_degrade: Option<Instant>,
    outstanding: u32,
}

impl OverloadDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        let weights = cfg.weights.normalized();
        Self {
            cfg,
            weights,
            above_since: None,
            below_since: None,
            last_degrade: None,
            outstanding: 0,
        }
    }

    pub fn score(&self, inputs: &LoadInputs) -> f64 {
        self.weights.score(inputs)
    }

    /// Degrades emitted and not yet restored.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn observe(&mut self, inputs: &LoadInputs, now: Instant) -> (f64, Option<Signal>) {
        let score = self.score(inputs);
        (score, self.observe_score(score, now))
    }

    pub fn observe_score(&mut self, score: f64, now: Instant) -> Option<Signal> {
        if score > self.cfg.rising_threshold {
            self.below_since = None;
            let since = *self.above_since.get_or_insert(now);
            if self.outstanding == 0 {
                if now.duration_since(since) >= self.cfg.rising_sustain {
                    return Some(self.degrade(now));
                }
            } else if let (Some(every), Some(last)) =
                (self.cfg.escalation_interval, self.last_degrade)
            {
                if now.duration_since(last) >= every && now.duration_since(since) >= every {
                    return Some(self.degrade(now));
                }
            }
        } else if score < self.cfg.falling_threshold {
            self.above_since = None;
            if self.outstanding == 0 {
                self.below_since = None;
                return None;
            }
            let since = *self.below_since.get_or_insert(now);
            if now.duration_since(since) >= self.cfg.falling_sustain {
                self.outstanding -= 1;
                // each further restore needs its own sustained interval
                self.below_since = Some(now);
                return Some(Signal::Restore);
            }
        } else {
            self.above_since = None;
            self.below_since = None;
        }
        None
    }

    fn degrade(&mut self, now: Instant) -> Signal {
        self.outstanding += 1;
        self.last_degrade = Some(now);
        Signal::Degrade
    }
}
