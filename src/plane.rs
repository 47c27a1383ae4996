//! Composition root: one object owning every reliability component.

use crate::approval::{
    handle_respond, ApprovalGate, ApprovalOutcome, ApprovalResponse, RespondRequest,
    RespondResponse,
};
use crate::backpressure::{BackpressureCoordinator, BackpressureSnapshot};
use crate::cache::{CacheBackend, CacheConfig, CacheManager, MemoryCache};
use crate::config::ReliabilityConfig;
use crate::degradation::{DegradationManager, FallbackStrategy, FeatureSpec};
use crate::queue::{DeadLetterSink, TaskHandler, TaskQueue, WorkerPool};
use crate::resilience::{BreakerRegistry, CheckResult, RateLimiter};
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type ShutdownHook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Builder for [`ReliabilityPlane`].
pub struct ReliabilityPlaneBuilder {
    config: ReliabilityConfig,
    lkg_backend: Option<Box<dyn CacheBackend>>,
    features: Vec<(String, FeatureSpec)>,
}

impl ReliabilityPlaneBuilder {
    pub fn new() -> Self {
        Self {
            config: ReliabilityConfig::default(),
            lkg_backend: None,
            features: Vec::new(),
        }
    }

    pub fn config(mut self, config: ReliabilityConfig) -> Self {
        self.config = config;
        self
    }

    /// Backend for last-known-good fallback values. Defaults to an in-memory
    /// LRU sized by `degradation.cache_max_entries`.
    pub fn lkg_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.lkg_backend = Some(backend);
        self
    }

    /// Register a feature in code, e.g. one with a service fallback.
    /// Takes precedence over a config entry of the same name.
    pub fn feature(mut self, name: impl Into<String>, spec: FeatureSpec) -> Self {
        self.features.push((name.into(), spec));
        self
    }

    /// Validate the config and wire the components. Nothing is spawned until
    /// [`ReliabilityPlane::start`].
    pub fn build(self) -> Result<ReliabilityPlane> {
        let config = self.config;
        config.validate()?;

        let mut breakers = BreakerRegistry::new(config.breaker.defaults.to_config());
        for (name, settings) in &config.breaker.overrides {
            breakers = breakers.with_override(name.clone(), settings.to_config());
        }
        let breakers = Arc::new(breakers);
        let limiter = Arc::new(RateLimiter::new(config.limiter.to_config()));

        let backend: Box<dyn CacheBackend> = match self.lkg_backend {
            Some(backend) => backend,
            None => Box::new(MemoryCache::new(config.degradation.cache_max_entries)),
        };
        let cache = CacheManager::new(CacheConfig::new().with_key_prefix("lkg"), backend);
        let degradation = Arc::new(DegradationManager::with_cache(Arc::clone(&breakers), cache));
        for (name, feature) in &config.degradation.features {
            degradation.register_feature(name.clone(), feature.to_spec())?;
        }
        for (name, spec) in self.features {
            degradation.register_feature(name, spec)?;
        }

        let approvals = Arc::new(ApprovalGate::new(config.approval.to_config()));
        let coordinator = Arc::new(BackpressureCoordinator::new(
            config.backpressure.to_config(),
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            Arc::clone(&degradation),
        ));

        info!(
            breaker_overrides = config.breaker.overrides.len(),
            features = degradation.snapshot().features.len(),
            "reliability plane built"
        );
        Ok(ReliabilityPlane {
            config,
            breakers,
            limiter,
            degradation,
            approvals,
            coordinator,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            sampler: Mutex::new(None),
            pools: Mutex::new(Vec::new()),
        })
    }
}

impl Default for ReliabilityPlaneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Breakers, limiter, degradation manager, approval gate and backpressure
/// coordinator, shared by reference with every consumer.
pub struct ReliabilityPlane {
    config: ReliabilityConfig,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    degradation: Arc<DegradationManager>,
    approvals: Arc<ApprovalGate>,
    coordinator: Arc<BackpressureCoordinator>,
    cancel: CancellationToken,
    started: AtomicBool,
    sampler: Mutex<Option<JoinHandle<()>>>,
    pools: Mutex<Vec<ShutdownHook>>,
}

impl ReliabilityPlane {
    pub fn builder() -> ReliabilityPlaneBuilder {
        ReliabilityPlaneBuilder::new()
    }

    pub fn from_config(config: ReliabilityConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Spawn the backpressure sampling loop. Must run inside a tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.coordinator.spawn(self.cancel.child_token());
        *self
            .sampler
            .lock()
            .map_err(|_| Error::poisoned("reliability_plane"))? = Some(handle);
        info!(
            tick_ms = self.config.backpressure.tick_interval_ms,
            "reliability plane started"
        );
        Ok(())
    }

    /// Stop the sampling loop, then every pool built by this plane.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sampler = self.sampler.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = sampler {
            let _ = handle.await;
        }
        let hooks: Vec<ShutdownHook> = match self.pools.lock() {
            Ok(mut pools) => pools.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for hook in &hooks {
            hook().await;
        }
        info!(pools = hooks.len(), "reliability plane stopped");
    }

    /// Admission decision for `key`.
    pub fn check(&self, key: &str, cost: u32) -> Result<CheckResult> {
        self.limiter.check(key, cost)
    }

    /// Run `op` through the breaker named `name`.
    pub async fn call_with_breaker<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breakers.call(name, op).await
    }

    /// Build, start and attach a worker pool over a fresh queue sized by the
    /// `queue` config section. The pool feeds backpressure sampling and is
    /// stopped by [`shutdown`](Self::shutdown).
    pub fn worker_pool<T: Clone + Send + Sync + 'static>(
        &self,
        handler: Arc<dyn TaskHandler<T>>,
        dead_letters: Option<Arc<dyn DeadLetterSink<T>>>,
    ) -> Result<WorkerPool<T>> {
        let queue = Arc::new(TaskQueue::new(self.config.queue.to_queue_config()));
        let mut pool = WorkerPool::new(queue, handler, self.config.queue.to_pool_config());
        if let Some(sink) = dead_letters {
            pool = pool.with_dead_letter_sink(sink);
        }
        pool.start()?;
        self.coordinator.attach(Arc::new(pool.clone()));

        let hook_pool = pool.clone();
        let hook: ShutdownHook = Box::new(move || {
            let pool = hook_pool.clone();
            Box::pin(async move { pool.shutdown().await })
        });
        self.pools
            .lock()
            .map_err(|_| Error::poisoned("reliability_plane"))?
            .push(hook);
        debug!("worker pool attached");
        Ok(pool)
    }

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
        self.degradation
            .execute_with_fallback(feature, primary, fallback)
            .await
    }

    pub fn register_feature(&self, name: impl Into<String>, spec: FeatureSpec) -> Result<()> {
        self.degradation.register_feature(name, spec)
    }

    pub async fn request_approval(
        &self,
        correlation_id: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<ApprovalOutcome> {
        self.approvals
            .request_approval(correlation_id, payload, timeout)
            .await
    }

    pub fn respond_to_approval(&self, correlation_id: &str, response: ApprovalResponse) -> bool {
        self.approvals.respond_to_approval(correlation_id, response)
    }

    /// `POST /approval/respond` handler; see [`handle_respond`].
    pub fn handle_respond(&self, req: RespondRequest) -> (u16, RespondResponse) {
        handle_respond(&self.approvals, req)
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn coordinator(&self) -> &Arc<BackpressureCoordinator> {
        &self.coordinator
    }

    pub fn backpressure(&self) -> BackpressureSnapshot {
        self.coordinator.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FallbackSection, FeatureSection};
    use crate::degradation::DegradationLevel;
    use crate::queue::{handler_fn, InMemoryDeadLetterSink, Priority, TaskContext};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ReliabilityConfig {
        let mut cfg = ReliabilityConfig::default();
        cfg.breaker.defaults.failure_threshold = 2;
        cfg.degradation.features.insert(
            "recs".to_string(),
            FeatureSection {
                available_until: DegradationLevel::Full,
                fallback: Some(FallbackSection::Static { value: json!([]) }),
            },
        );
        cfg
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut cfg = ReliabilityConfig::default();
        cfg.queue.max_size = 0;
        assert!(matches!(
            ReliabilityPlane::from_config(cfg),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_config_features_are_registered() {
        let plane = ReliabilityPlane::from_config(config()).unwrap();
        plane.degradation().set_override(Some(DegradationLevel::Degraded)).unwrap();
        let value = plane
            .execute_with_fallback("recs", || async { Ok(json!(["a"])) }, None)
            .await
            .unwrap();
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn test_breaker_overrides_apply() {
        let mut cfg = config();
        cfg.breaker.overrides.insert(
            "crm".to_string(),
            crate::config::BreakerSettings {
                failure_threshold: 7,
                ..Default::default()
            },
        );
        let plane = ReliabilityPlane::from_config(cfg).unwrap();
        assert_eq!(plane.breakers().get("crm").config().failure_threshold, 7);
        assert_eq!(plane.breakers().get("kg").config().failure_threshold, 2);
        let v = plane
            .call_with_breaker("kg", || async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn test_worker_pool_lifecycle() {
        let plane = ReliabilityPlane::from_config(config()).unwrap();
        plane.start().unwrap();
        plane.start().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = handler_fn(move |_ctx: TaskContext, n: usize| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
        });
        let sink = Arc::new(InMemoryDeadLetterSink::<usize>::new(8));
        let pool = plane
            .worker_pool::<usize>(Arc::new(handler), Some(sink.clone()))
            .unwrap();
        pool.enqueue(2, Priority::Normal, None).await.unwrap();
        pool.enqueue(3, Priority::High, None).await.unwrap();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        plane.shutdown().await;
        assert!(pool.queue().is_closed());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_check_and_respond_not_found() {
        let plane = ReliabilityPlane::from_config(ReliabilityConfig::default()).unwrap();
        assert!(plane.check("tenant", 1).unwrap().allowed);
        let (code, _) = plane.handle_respond(RespondRequest {
            run_id: "nope".to_string(),
            approved: true,
            modified_data: None,
            reason: None,
        });
        assert_eq!(code, 404);
    }
}
