//! Breaker registry.

use super::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Named circuit breakers, one per dependency.
///
/// Built once at startup and shared by reference. Breakers are created lazily
/// from the default config, or from a per-name override when one is set.
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), cfg);
        self
    }

    /// Breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(cb) = self.find(name) {
            return cb;
        }
        let mut breakers = match self.breakers.write() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cb = breakers.entry(name.to_string()).or_insert_with(|| {
            let cfg = self.overrides.get(name).unwrap_or(&self.defaults).clone();
            Arc::new(CircuitBreaker::new(name, cfg))
        });
        Arc::clone(cb)
    }

    /// Breaker for `name` if it already exists.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().ok()?.get(name).cloned()
    }

    /// Guarded call: run `op` through the breaker for `name`.
    pub async fn call<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get(name).call(op).await
    }

    /// State of an existing breaker; unknown names have never failed.
    pub fn state(&self, name: &str) -> BreakerState {
        self.find(name)
            .map(|cb| cb.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state(name) == BreakerState::Open
    }

    pub fn open_count(&self) -> usize {
        self.all()
            .iter()
            .filter(|cb| cb.state() == BreakerState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snaps: Vec<_> = self.all().iter().map(|cb| cb.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
