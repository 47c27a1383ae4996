//! Backpressure coordinator: samples load and drives the degradation manager.

use super::detector::{DetectorConfig, LoadInputs, OverloadDetector};
use crate::degradation::{DegradationManager, Signal};
use crate::resilience::{BreakerRegistry, LimiterStats, RateLimiter};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue/worker load exposed by a worker pool.
pub trait LoadSource: Send + Sync {
    fn queue_utilization(&self) -> f64;
    fn worker_saturation(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub tick_interval: Duration,
    pub detector: DetectorConfig,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            detector: DetectorConfig::default(),
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_thresholds(mut self, rising: f64, falling: f64) -> Self {
        self.detector.rising_threshold = rising;
        self.detector.falling_threshold = falling;
        self
    }

    pub fn with_sustain(mut self, rising: Duration, falling: Duration) -> Self {
        self.detector.rising_sustain = rising;
        self.detector.falling_sustain = falling;
        self
    }

    pub fn with_escalation_interval(mut self, interval: Duration) -> Self {
        self.detector.escalation_interval = Some(interval);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackpressureSnapshot {
    pub score: f64,
    pub inputs: LoadInputs,
    pub outstanding_degrades: u32,
    pub signals_emitted: u64,
    pub ticks: u64,
}

struct TickState {
    detector: OverloadDetector,
    last_limiter: LimiterStats,
    seq: u64,
    snapshot: BackpressureSnapshot,
}

pub struct BackpressureCoordinator {
    cfg: BackpressureConfig,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    degradation: Arc<DegradationManager>,
    sources: RwLock<Vec<Arc<dyn LoadSource>>>,
    state: Mutex<TickState>,
}

impl BackpressureCoordinator {
    pub fn new(
        cfg: BackpressureConfig,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        degradation: Arc<DegradationManager>,
    ) -> Self {
        let state = TickState {
            detector: OverloadDetector::new(cfg.detector.clone()),
            last_limiter: limiter.stats(),
            seq: 0,
            snapshot: BackpressureSnapshot::default(),
        };
        Self {
            cfg,
            limiter,
            breakers,
            degradation,
            sources: RwLock::new(Vec::new()),
            state: Mutex::new(state),
        }
    }

    /// Include a worker pool in queue and worker sampling.
    pub fn attach(&self, source: Arc<dyn LoadSource>) {
        match self.sources.write() {
            Ok(mut sources) => sources.push(source),
            Err(poisoned) => poisoned.into_inner().push(source),
        }
    }

    /// Current inputs. The rejection ratio covers the interval since `previous`;
    /// queue and worker inputs are the worst across attached pools.
    fn sample(&self, previous: &LimiterStats) -> (LoadInputs, LimiterStats) {
        let stats = self.limiter.stats();
        let (queue, workers) = self
            .sources
            .read()
            .map(|sources| {
                sources.iter().fold((0.0f64, 0.0f64), |(q, w), s| {
                    (q.max(s.queue_utilization()), w.max(s.worker_saturation()))
                })
            })
            .unwrap_or((0.0, 0.0));
        let total = self.breakers.len();
        let breaker_open_ratio = if total == 0 {
            0.0
        } else {
            self.breakers.open_count() as f64 / total as f64
        };
        let inputs = LoadInputs {
            rejection_ratio: stats.since(previous).rejection_ratio(),
            queue_utilization: queue,
            worker_saturation: workers,
            breaker_open_ratio,
        };
        (inputs, stats)
    }

    /// One sampling step. Any emitted signal is applied to the degradation
    /// manager before returning.
    pub fn tick(&self, now: Instant) -> Result<Option<Signal>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::poisoned("backpressure_coordinator"))?;
        let (inputs, stats) = self.sample(&state.last_limiter);
        state.last_limiter = stats;

        let (score, signal) = state.detector.observe(&inputs, now);
        state.snapshot.score = score;
        state.snapshot.inputs = inputs;
        state.snapshot.ticks += 1;
        state.snapshot.outstanding_degrades = state.detector.outstanding();
        debug!(score, ?inputs, "backpressure sample");

        if let Some(signal) = signal {
            state.seq += 1;
            state.snapshot.signals_emitted += 1;
            info!(score, ?signal, seq = state.seq, "backpressure signal");
            self.degradation.apply_signal(signal, state.seq)?;
        }
        Ok(signal)
    }

    pub fn snapshot(&self) -> BackpressureSnapshot {
        self.state
            .lock()
            .map(|s| s.snapshot.clone())
            .unwrap_or_default()
    }

    /// Tick every `tick_interval` until `cancel` fires. Each tick also sweeps
    /// idle limiter entries.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Instant::now()) {
                        warn!(error = %e, "backpressure tick failed");
                    }
                    self.limiter.evict_idle();
                }
            }
        }
        debug!("backpressure coordinator stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }
}
