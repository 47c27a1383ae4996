use crate::error_code::FailureClass;
use crate::telemetry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker position in the Closed → Open → HalfOpen cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for the `breaker_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub half_open_success_count: u32,
    pub half_open_admitted: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
    /// Time since the last state transition, in ms.
    pub since_transition_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    /// Consecutive probe successes needed to close; defaults to `half_open_max_calls`.
    pub half_open_success_threshold: Option<u32>,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Option<Duration>,
    /// Failure classes that count against the breaker.
    pub tripping_classes: Vec<FailureClass>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            half_open_success_threshold: None,
            failure_window: None,
            tripping_classes: vec![
                FailureClass::Timeout,
                FailureClass::Connection,
                FailureClass::ServerError,
                FailureClass::Overloaded,
            ],
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_half_open_success_threshold(mut self, successes: u32) -> Self {
        self.half_open_success_threshold = Some(successes);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = Some(window);
        self
    }

    pub fn with_tripping_classes(mut self, classes: Vec<FailureClass>) -> Self {
        self.tripping_classes = classes;
        self
    }

    /// Whether a failure of this class counts against the breaker.
    pub fn trips_on(&self, class: FailureClass) -> bool {
        self.tripping_classes.contains(&class)
    }

    fn success_threshold(&self) -> u32 {
        self.half_open_success_threshold
            .unwrap_or(self.half_open_max_calls)
            .clamp(1, self.half_open_max_calls.max(1))
    }
}

/// Admission token handed out by [`CircuitBreaker::allow`].
///
/// Outcomes are only applied if the breaker has not transitioned since the
/// permit was issued, so a slow call started while Closed cannot close a
/// breaker that has since re-opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
    probe: bool,
}

impl Permit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug)]
struct State {
    state: BreakerState,
    generation: u64,
    failure_count: u32,
    first_failure_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_success_count: u32,
    last_transition: Instant,
}

impl State {
    fn transition(&mut self, to: BreakerState, now: Instant) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.last_transition = now;
        self.half_open_admitted = 0;
        self.half_open_success_count = 0;
        if to != BreakerState::Open {
            self.failure_count = 0;
            self.first_failure_at = None;
        }
    }
}

/// Per-dependency circuit breaker.
///
/// All state lives behind one mutex per instance; transitions are linearizable
/// per breaker and never take another breaker's lock.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: BreakerState::Closed,
                generation: 0,
                failure_count: 0,
                first_failure_at: None,
                half_open_admitted: 0,
                half_open_success_count: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    /// Ask to run one call. Fails fast with [`Error::CircuitOpen`] while open.
    pub fn allow(&self) -> Result<Permit> {
        let now = Instant::now();
        let mut st = self.state.lock().map_err(|_| Error::poisoned("circuit_breaker"))?;
        let mut transitioned = None;

        if st.state == BreakerState::Open {
            let elapsed = now.duration_since(st.last_transition);
            if elapsed < self.cfg.recovery_timeout {
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after: self.cfg.recovery_timeout - elapsed,
                });
            }
            st.transition(BreakerState::HalfOpen, now);
            transitioned = Some(BreakerState::HalfOpen);
        }

        let permit = match st.state {
            BreakerState::Closed => Permit {
                generation: st.generation,
                probe: false,
            },
            BreakerState::HalfOpen => {
                if st.half_open_admitted >= self.cfg.half_open_max_calls {
                    // Probes that never reported back would wedge the breaker;
                    // restart the probe round once a full recovery period passes.
                    let elapsed = now.duration_since(st.last_transition);
                    if elapsed >= self.cfg.recovery_timeout {
                        st.transition(BreakerState::HalfOpen, now);
                    } else {
                        return Err(Error::CircuitOpen {
                            name: self.name.clone(),
                            retry_after: self.cfg.recovery_timeout - elapsed,
                        });
                    }
                }
                st.half_open_admitted += 1;
                Permit {
                    generation: st.generation,
                    probe: true,
                }
            }
            BreakerState::Open => unreachable!("open state handled above"),
        };
        let failures = st.failure_count;
        drop(st);

        if let Some(to) = transitioned {
            self.announce(to, failures);
        }
        Ok(permit)
    }

    /// Record a successful call (or one that failed for a non-tripping reason).
    pub fn on_success(&self, permit: Permit) {
        let now = Instant::now();
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        if permit.generation != st.generation {
            return;
        }
        let mut transitioned = None;
        let mut cleared = false;
        match st.state {
            BreakerState::Closed => {
                cleared = st.failure_count != 0;
                st.failure_count = 0;
                st.first_failure_at = None;
            }
            BreakerState::HalfOpen => {
                st.half_open_success_count += 1;
                if st.half_open_success_count >= self.cfg.success_threshold() {
                    st.transition(BreakerState::Closed, now);
                    transitioned = Some(BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
        let failures = st.failure_count;
        drop(st);
        if let Some(to) = transitioned {
            self.announce(to, failures);
        } else if cleared {
            telemetry::record_breaker_failures(&self.name, 0);
        }
    }

    /// Record a failed call. Non-tripping classes are treated as a success:
    /// the dependency answered, so it is reachable.
    pub fn on_failure(&self, permit: Permit, class: FailureClass) {
        if !self.cfg.trips_on(class) {
            self.on_success(permit);
            return;
        }
        let now = Instant::now();
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        if permit.generation != st.generation {
            return;
        }
        let mut transitioned = None;
        match st.state {
            BreakerState::Closed => {
                if let (Some(window), Some(first)) = (self.cfg.failure_window, st.first_failure_at)
                {
                    if now.duration_since(first) > window {
                        st.failure_count = 0;
                        st.first_failure_at = None;
                    }
                }
                if st.first_failure_at.is_none() {
                    st.first_failure_at = Some(now);
                }
                st.failure_count = st.failure_count.saturating_add(1);
                if st.failure_count >= self.cfg.failure_threshold {
                    st.transition(BreakerState::Open, now);
                    transitioned = Some(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                st.failure_count = st.failure_count.saturating_add(1);
                st.transition(BreakerState::Open, now);
                transitioned = Some(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
        let failures = st.failure_count;
        drop(st);

        match transitioned {
            Some(to) => self.announce(to, failures),
            None => telemetry::record_breaker_failures(&self.name, failures),
        }
    }

    /// Run `op` under the breaker.
    ///
    /// The operation is never invoked while the breaker is open.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.allow()?;
        match op().await {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(permit, err.failure_class());
                Err(err)
            }
        }
    }

    /// Current state, without triggering the Open → HalfOpen move.
    pub fn state(&self) -> BreakerState {
        self.state
            .lock()
            .map(|st| st.state)
            .unwrap_or(BreakerState::Open)
    }

    /// Operator action: force the breaker closed and clear all counters.
    pub fn reset(&self) {
        let now = Instant::now();
        if let Ok(mut st) = self.state.lock() {
            if st.state == BreakerState::Closed && st.failure_count == 0 {
                return;
            }
            st.transition(BreakerState::Closed, now);
        }
        self.announce(BreakerState::Closed, 0);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let (state, failure_count, half_open_success_count, half_open_admitted, since) =
            match self.state.lock() {
                Ok(st) => (
                    st.state,
                    st.failure_count,
                    st.half_open_success_count,
                    st.half_open_admitted,
                    now.duration_since(st.last_transition),
                ),
                Err(_) => (BreakerState::Open, 0, 0, 0, Duration::ZERO),
            };
        let open_remaining_ms = if state == BreakerState::Open && since < self.cfg.recovery_timeout {
            Some((self.cfg.recovery_timeout - since).as_millis() as u64)
        } else {
            None
        };
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count,
            half_open_success_count,
            half_open_admitted,
            failure_threshold: self.cfg.failure_threshold,
            recovery_timeout_ms: self.cfg.recovery_timeout.as_millis() as u64,
            half_open_max_calls: self.cfg.half_open_max_calls,
            since_transition_ms: since.as_millis() as u64,
            open_remaining_ms,
        }
    }

    fn announce(&self, to: BreakerState, failures: u32) {
        match to {
            BreakerState::Open => warn!(
                breaker = %self.name,
                failures,
                recovery_timeout_ms = self.cfg.recovery_timeout.as_millis() as u64,
                "circuit breaker opened"
            ),
            BreakerState::HalfOpen => info!(breaker = %self.name, "circuit breaker half-open, probing"),
            BreakerState::Closed => info!(breaker = %self.name, "circuit breaker closed"),
        }
        telemetry::record_breaker_state(&self.name, to);
        telemetry::record_breaker_failures(&self.name, failures);
    }
}
