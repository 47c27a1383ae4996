//! Degradation manager: service level, feature availability and fallback dispatch.

use super::fallback::FallbackStrategy;
use super::level::{DegradationLevel, Signal};
use crate::cache::{CacheConfig, CacheManager, MemoryCache};
use crate::resilience::BreakerRegistry;
use crate::telemetry;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registration of one capability.
#[derive(Debug, Clone)]
pub struct FeatureSpec {
    /// Most degraded level at which the feature still runs.
    pub available_until: DegradationLevel,
    pub fallback: Option<FallbackStrategy>,
}

impl FeatureSpec {
    pub fn new(available_until: DegradationLevel) -> Self {
        Self {
            available_until,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[derive(Debug, Clone)]
struct DegradationState {
    /// Effective level: the override if pinned, else `signal_level`.
    level: DegradationLevel,
    signal_level: DegradationLevel,
    override_level: Option<DegradationLevel>,
    last_seq: Option<u64>,
    changed_at: Instant,
    features: HashMap<String, FeatureSpec>,
}

impl DegradationState {
    fn allows(&self, feature: &str) -> bool {
        match self.features.get(feature) {
            Some(spec) => self.level <= spec.available_until,
            None => self.level < DegradationLevel::Maintenance,
        }
    }
}

/// Fallback outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackOutcomes {
    pub primary_success: u64,
    pub primary_failure: u64,
    pub fallback_invoked: u64,
    pub fallback_failed: u64,
    pub skipped_breaker_open: u64,
    pub skipped_level: u64,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    PrimarySuccess,
    PrimaryFailure,
    FallbackInvoked,
    FallbackFailed,
    SkippedBreakerOpen,
    SkippedLevel,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::PrimarySuccess => "primary_success",
            Outcome::PrimaryFailure => "primary_failure",
            Outcome::FallbackInvoked => "fallback_invoked",
            Outcome::FallbackFailed => "fallback_failed",
            Outcome::SkippedBreakerOpen => "skipped_breaker_open",
            Outcome::SkippedLevel => "skipped_level",
        }
    }
}

#[derive(Default)]
struct AtomicOutcomes {
    primary_success: AtomicU64,
    primary_failure: AtomicU64,
    fallback_invoked: AtomicU64,
    fallback_failed: AtomicU64,
    skipped_breaker_open: AtomicU64,
    skipped_level: AtomicU64,
}

impl AtomicOutcomes {
    fn bump(&self, feature: &str, outcome: Outcome) {
        let counter = match outcome {
            Outcome::PrimarySuccess => &self.primary_success,
            Outcome::PrimaryFailure => &self.primary_failure,
            Outcome::FallbackInvoked => &self.fallback_invoked,
            Outcome::FallbackFailed => &self.fallback_failed,
            Outcome::SkippedBreakerOpen => &self.skipped_breaker_open,
            Outcome::SkippedLevel => &self.skipped_level,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_fallback_outcome(feature, outcome.as_str());
    }

    fn to_outcomes(&self) -> FallbackOutcomes {
        FallbackOutcomes {
            primary_success: self.primary_success.load(Ordering::Relaxed),
            primary_failure: self.primary_failure.load(Ordering::Relaxed),
            fallback_invoked: self.fallback_invoked.load(Ordering::Relaxed),
            fallback_failed: self.fallback_failed.load(Ordering::Relaxed),
            skipped_breaker_open: self.skipped_breaker_open.load(Ordering::Relaxed),
            skipped_level: self.skipped_level.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationSnapshot {
    pub level: DegradationLevel,
    pub signal_level: DegradationLevel,
    pub override_level: Option<DegradationLevel>,
    pub last_seq: Option<u64>,
    pub since_change_ms: u64,
    pub features: Vec<String>,
    pub outcomes: FallbackOutcomes,
}

/// Owner of the single degradation state.
///
/// Readers load an `ArcSwap` snapshot without locking; writes are serialized
/// through one writer lock.
pub struct DegradationManager {
    state: ArcSwap<DegradationState>,
    writer: Mutex<()>,
    breakers: Arc<BreakerRegistry>,
    cache: CacheManager,
    outcomes: AtomicOutcomes,
}

impl DegradationManager {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self::with_cache(
            breakers,
            CacheManager::new(
                CacheConfig::new().with_key_prefix("lkg"),
                Box::new(MemoryCache::new(1024)),
            ),
        )
    }

    pub fn with_cache(breakers: Arc<BreakerRegistry>, cache: CacheManager) -> Self {
        telemetry::record_degradation_level(DegradationLevel::Full);
        Self {
            state: ArcSwap::from_pointee(DegradationState {
                level: DegradationLevel::Full,
                signal_level: DegradationLevel::Full,
                override_level: None,
                last_seq: None,
                changed_at: Instant::now(),
                features: HashMap::new(),
            }),
            writer: Mutex::new(()),
            breakers,
            cache,
            outcomes: AtomicOutcomes::default(),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        self.state.load().level
    }

    pub fn register_feature(&self, name: impl Into<String>, spec: FeatureSpec) -> Result<()> {
        let name = name.into();
        self.update(|state| {
            state.features.insert(name, spec);
            false
        })
    }

    /// Whether `feature` runs at the current level. Unregistered features run
    /// at every level except `Maintenance`.
    pub fn is_available(&self, feature: &str) -> bool {
        self.state.load().allows(feature)
    }

    /// Apply a degrade/restore signal carrying sequence number `seq`.
    ///
    /// Returns `false` for a sequence number that was already applied. While an
    /// operator override is pinned the signal still moves the underlying level,
    /// which takes effect once the override is cleared.
    pub fn apply_signal(&self, signal: Signal, seq: u64) -> Result<bool> {
        let mut applied = false;
        self.update(|state| {
            if state.last_seq.map_or(false, |last| seq <= last) {
                debug!(seq, ?signal, "ignoring already-applied signal");
                return false;
            }
            state.last_seq = Some(seq);
            state.signal_level = match signal {
                Signal::Degrade => state.signal_level.worse(),
                Signal::Restore => state.signal_level.better(),
            };
            applied = true;
            true
        })?;
        Ok(applied)
    }

    /// Pin the level (`Some`) or return control to backpressure signals (`None`).
    pub fn set_override(&self, level: Option<DegradationLevel>) -> Result<()> {
        self.update(|state| {
            state.override_level = level;
            info!(?level, "degradation override set");
            true
        })
    }

    pub fn outcomes(&self) -> FallbackOutcomes {
        self.outcomes.to_outcomes()
    }

    pub fn snapshot(&self) -> DegradationSnapshot {
        let state = self.state.load();
        let mut features: Vec<String> = state.features.keys().cloned().collect();
        features.sort();
        DegradationSnapshot {
            level: state.level,
            signal_level: state.signal_level,
            override_level: state.override_level,
            last_seq: state.last_seq,
            since_change_ms: state.changed_at.elapsed().as_millis() as u64,
            features,
            outcomes: self.outcomes.to_outcomes(),
        }
    }

    /// Run `primary` for `feature`, falling back when it is skipped or fails.
    ///
    /// The primary is skipped when the current level excludes the feature or the
    /// breaker named `feature` rejects the call. `fallback` overrides the
    /// registered strategy. With no fallback the skip or failure error is
    /// returned; if the fallback fails too, both errors come back in
    /// [`Error::FallbackFailed`].
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        feature: &str,
        primary: F,
        fallback: Option<FallbackStrategy>,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let state = self.state.load_full();
        let fallback = fallback.or_else(|| {
            state
                .features
                .get(feature)
                .and_then(|spec| spec.fallback.clone())
        });

        if !state.allows(feature) {
            self.outcomes.bump(feature, Outcome::SkippedLevel);
            let err = Error::FeatureUnavailable {
                feature: feature.to_string(),
                level: state.level,
            };
            return self.fall_back(feature, fallback, err).await;
        }

        let breaker = self.breakers.get(feature);
        let permit = match breaker.allow() {
            Ok(permit) => permit,
            Err(err) => {
                self.outcomes.bump(feature, Outcome::SkippedBreakerOpen);
                return self.fall_back(feature, fallback, err).await;
            }
        };

        match primary().await {
            Ok(value) => {
                breaker.on_success(permit);
                self.outcomes.bump(feature, Outcome::PrimarySuccess);
                if let Some(FallbackStrategy::Cached { ttl }) = &fallback {
                    if let Err(e) = self.cache.set_with_ttl(feature, &value, *ttl).await {
                        warn!(feature, error = %e, "failed to store last-known-good value");
                    }
                }
                Ok(value)
            }
            Err(err) => {
                breaker.on_failure(permit, err.failure_class());
                self.outcomes.bump(feature, Outcome::PrimaryFailure);
                self.fall_back(feature, fallback, err).await
            }
        }
    }

    async fn fall_back(
        &self,
        feature: &str,
        fallback: Option<FallbackStrategy>,
        primary_err: Error,
    ) -> Result<Value> {
        let strategy = match fallback {
            Some(strategy) => strategy,
            None => return Err(primary_err),
        };
        self.outcomes.bump(feature, Outcome::FallbackInvoked);
        debug!(feature, strategy = strategy.kind(), reason = %primary_err, "invoking fallback");

        let result = match &strategy {
            FallbackStrategy::Cached { .. } => match self.cache.get::<Value>(feature).await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(Error::runtime_with_context(
                    "no fresh cached value",
                    ErrorContext::new().with_source("degradation_manager"),
                )),
                Err(e) => Err(e),
            },
            FallbackStrategy::Static(value) => Ok(value.clone()),
            FallbackStrategy::Service(service) => service.call(feature).await,
        };

        result.map_err(|fallback_err| {
            self.outcomes.bump(feature, Outcome::FallbackFailed);
            warn!(feature, primary = %primary_err, fallback = %fallback_err, "fallback failed");
            Error::FallbackFailed {
                feature: feature.to_string(),
                primary: Box::new(primary_err),
                fallback: Box::new(fallback_err),
            }
        })
    }

    /// Copy-modify-store under the writer lock. `mutate` returns whether the
    /// effective level may have changed.
    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DegradationState) -> bool,
    {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| Error::poisoned("degradation_manager"))?;
        let current = self.state.load_full();
        let mut next = (*current).clone();
        if mutate(&mut next) {
            next.level = next.override_level.unwrap_or(next.signal_level);
            if next.level != current.level {
                next.changed_at = Instant::now();
                info!(from = %current.level, to = %next.level, "service level changed");
                telemetry::record_degradation_level(next.level);
            }
        }
        self.state.store(Arc::new(next));
        Ok(())
    }
}
