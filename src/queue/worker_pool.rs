//! Elastic worker pool draining a [`TaskQueue`].

use super::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, LoggingDeadLetterSink};
use super::task_queue::{Priority, QueueEntry, TaskId, TaskQueue};
use crate::backpressure::LoadSource;
use crate::telemetry;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// What a handler sees about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub priority: Priority,
}

/// Processes one task payload.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, ctx: TaskContext, payload: T) -> Result<()>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler(f)
}

#[async_trait]
impl<T, F, Fut> TaskHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(TaskContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, payload: T) -> Result<()> {
        (self.0)(ctx, payload).await
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Scale up when utilization stays above this for `scale_sustain`.
    pub high_watermark: f64,
    /// Scale down when utilization stays below this for `scale_sustain`.
    pub low_watermark: f64,
    pub scale_sustain: Duration,
    pub sample_interval: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            high_watermark: 0.8,
            low_watermark: 0.2,
            scale_sustain: Duration::from_secs(10),
            sample_interval: Duration::from_secs(1),
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_watermarks(mut self, low: f64, high: f64) -> Self {
        self.low_watermark = low;
        self.high_watermark = high;
        self
    }

    pub fn with_scale_sustain(mut self, sustain: Duration) -> Self {
        self.scale_sustain = sustain;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Delay before re-enqueueing after `attempt` failed: base * 2^(attempt-1), capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleDecision {
    Up,
    Down,
    Hold,
}

/// Watermark tracker; each decision needs a fresh sustained interval.
#[derive(Debug, Default)]
struct Scaler {
    above_since: Option<Instant>,
    below_since: Option<Instant>,
}

impl Scaler {
    fn observe(
        &mut self,
        utilization: f64,
        current: usize,
        cfg: &PoolConfig,
        now: Instant,
    ) -> ScaleDecision {
        // an idle pool never drains a backlog below the high watermark
        if current == 0 && utilization > 0.0 && cfg.max_workers > 0 {
            self.above_since = None;
            self.below_since = None;
            return ScaleDecision::Up;
        }
        if utilization > cfg.high_watermark {
            self.below_since = None;
            let since = *self.above_since.get_or_insert(now);
            if now.duration_since(since) >= cfg.scale_sustain && current < cfg.max_workers {
                self.above_since = None;
                return ScaleDecision::Up;
            }
        } else if utilization < cfg.low_watermark {
            self.above_since = None;
            let since = *self.below_since.get_or_insert(now);
            if now.duration_since(since) >= cfg.scale_sustain && current > cfg.min_workers {
                self.below_since = None;
                return ScaleDecision::Down;
            }
        } else {
            self.above_since = None;
            self.below_since = None;
        }
        ScaleDecision::Hold
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub busy_workers: usize,
    /// busy / max_workers
    pub saturation: f64,
    pub completed: u64,
    pub failed_attempts: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

struct Worker {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PoolInner<T> {
    queue: Arc<TaskQueue<T>>,
    handler: Arc<dyn TaskHandler<T>>,
    dead_letters: RwLock<Arc<dyn DeadLetterSink<T>>>,
    cfg: PoolConfig,
    workers: Mutex<Vec<Worker>>,
    scaler: Mutex<Option<JoinHandle<()>>>,
    /// Pending retry timers; awaited on shutdown.
    retries: TaskTracker,
    cancel: CancellationToken,
    started: AtomicBool,
    next_worker_id: AtomicU64,
    busy: AtomicUsize,
    completed: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Worker pool with retry, dead-lettering and watermark-driven scaling.
///
/// Cloning shares the same pool.
pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> WorkerPool<T> {
    pub fn new(queue: Arc<TaskQueue<T>>, handler: Arc<dyn TaskHandler<T>>, cfg: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue,
                handler,
                dead_letters: RwLock::new(Arc::new(LoggingDeadLetterSink::default())),
                cfg,
                workers: Mutex::new(Vec::new()),
                scaler: Mutex::new(None),
                retries: TaskTracker::new(),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                next_worker_id: AtomicU64::new(0),
                busy: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_dead_letter_sink(self, sink: Arc<dyn DeadLetterSink<T>>) -> Self {
        if let Ok(mut slot) = self.inner.dead_letters.write() {
            *slot = sink;
        }
        self
    }

    /// Spawn `min_workers` workers and the scaling loop. Must run inside a tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for _ in 0..self.inner.cfg.min_workers {
            self.inner.spawn_worker()?;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.scale_loop());
        *self
            .inner
            .scaler
            .lock()
            .map_err(|_| Error::poisoned("worker_pool"))? = Some(handle);
        info!(
            min = self.inner.cfg.min_workers,
            max = self.inner.cfg.max_workers,
            "worker pool started"
        );
        Ok(())
    }

    /// Enqueue under the queue's full-queue policy.
    pub async fn enqueue(
        &self,
        payload: T,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<TaskId> {
        self.inner.queue.enqueue(payload, priority, timeout).await
    }

    pub fn queue(&self) -> &Arc<TaskQueue<T>> {
        &self.inner.queue
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = &self.inner;
        PoolSnapshot {
            current_workers: inner.worker_count(),
            min_workers: inner.cfg.min_workers,
            max_workers: inner.cfg.max_workers,
            busy_workers: inner.busy.load(Ordering::Relaxed),
            saturation: inner.saturation(),
            completed: inner.completed.load(Ordering::Relaxed),
            failed_attempts: inner.failed_attempts.load(Ordering::Relaxed),
            retried: inner.retried.load(Ordering::Relaxed),
            dead_lettered: inner.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and stop the scaler and all workers.
    ///
    /// In-flight attempts run to completion (each is bounded by its task timeout).
    /// Pending retries and entries still queued are dead-lettered as `QueueClosed`
    /// before this returns.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.close();

        let scaler = self.inner.scaler.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = scaler {
            let _ = handle.await;
        }
        let workers: Vec<Worker> = match self.inner.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            if let Err(e) = worker.handle.await {
                warn!(worker_id = worker.id, error = %e, "worker task ended abnormally");
            }
        }
        telemetry::record_active_workers(0);

        self.inner.retries.close();
        self.inner.retries.wait().await;
        let mut drained = 0usize;
        while let Some(entry) = self.inner.queue.try_dequeue() {
            drained += 1;
            self.inner
                .dead_letter(entry, DeadLetterReason::QueueClosed, "pool shut down".to_string())
                .await;
        }
        info!(drained, "worker pool stopped");
    }
}

impl<T: Clone + Send + Sync + 'static> PoolInner<T> {
    fn worker_count(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn saturation(&self) -> f64 {
        if self.cfg.max_workers == 0 {
            return 0.0;
        }
        (self.busy.load(Ordering::Relaxed) as f64 / self.cfg.max_workers as f64).min(1.0)
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| Error::poisoned("worker_pool"))?;
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel.child_token();
        let inner = Arc::clone(self);
        let worker_token = token.clone();
        let handle = tokio::spawn(async move { inner.worker_loop(id, worker_token).await });
        workers.push(Worker { id, token, handle });
        telemetry::record_active_workers(workers.len());
        debug!(worker_id = id, workers = workers.len(), "worker spawned");
        Ok(())
    }

    /// Ask the newest worker to stop after its current task.
    fn retire_worker(&self) -> Result<()> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| Error::poisoned("worker_pool"))?;
        if let Some(worker) = workers.pop() {
            worker.token.cancel();
            telemetry::record_active_workers(workers.len());
            debug!(worker_id = worker.id, workers = workers.len(), "worker retired");
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, id: u64, token: CancellationToken) {
        loop {
            let entry = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                entry = self.queue.dequeue() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            self.run_attempt(entry).await;
        }
        debug!(worker_id = id, "worker stopped");
    }

    async fn run_attempt(self: &Arc<Self>, mut entry: QueueEntry<T>) {
        entry.attempt_count += 1;
        let ctx = TaskContext {
            task_id: entry.id.clone(),
            attempt: entry.attempt_count,
            priority: entry.priority,
        };

        self.busy.fetch_add(1, Ordering::Relaxed);
        let attempt =
            AssertUnwindSafe(self.handler.handle(ctx, entry.payload.clone())).catch_unwind();
        let outcome = match tokio::time::timeout(entry.timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(
                    task_id = %entry.id,
                    attempt = entry.attempt_count,
                    %message,
                    "task handler panicked"
                );
                Err(Error::runtime_with_context(
                    "task handler panicked",
                    ErrorContext::new()
                        .with_details(message)
                        .with_source("worker_pool"),
                ))
            }
            Err(_) => Err(Error::TaskTimeout {
                task_id: entry.id.clone(),
                timeout: entry.timeout,
            }),
        };
        self.busy.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.on_failure(entry, err).await,
        }
    }

    async fn on_failure(self: &Arc<Self>, entry: QueueEntry<T>, err: Error) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let class = err.failure_class();
        if !class.retryable() {
            self.dead_letter(entry, DeadLetterReason::NonRetryable(class), err.to_string())
                .await;
            return;
        }
        if entry.attempt_count >= self.cfg.max_attempts {
            self.dead_letter(entry, DeadLetterReason::AttemptsExhausted, err.to_string())
                .await;
            return;
        }

        let delay = self.cfg.backoff_for(entry.attempt_count);
        self.retried.fetch_add(1, Ordering::Relaxed);
        debug!(
            task_id = %entry.id,
            attempt = entry.attempt_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "task attempt failed, retrying"
        );
        let inner = Arc::clone(self);
        let last_error = err.to_string();
        self.retries.spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.dead_letter(entry, DeadLetterReason::QueueClosed, last_error).await;
                }
                _ = tokio::time::sleep(delay) => inner.requeue(entry, last_error).await,
            }
        });
    }

    async fn requeue(&self, entry: QueueEntry<T>, last_error: String) {
        if let Err((err, entry)) = self.queue.push_entry(entry) {
            let reason = match err {
                Error::QueueFull { .. } => DeadLetterReason::QueueFull,
                _ => DeadLetterReason::QueueClosed,
            };
            self.dead_letter(entry, reason, last_error).await;
        }
    }

    async fn dead_letter(&self, entry: QueueEntry<T>, reason: DeadLetterReason, last_error: String) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %entry.id, attempts = entry.attempt_count, %reason, "dead-lettering task");
        let letter = DeadLetter {
            task_id: entry.id,
            payload: entry.payload,
            priority: entry.priority,
            attempts: entry.attempt_count,
            reason,
            last_error,
            age: entry.enqueued_at.elapsed(),
        };
        let sink = match self.dead_letters.read() {
            Ok(sink) => Arc::clone(&sink),
            Err(_) => return,
        };
        if let Err(e) = sink.deliver(letter).await {
            warn!(error = %e, "dead-letter sink rejected a letter");
        }
    }

    async fn scale_loop(self: Arc<Self>) {
        let mut scaler = Scaler::default();
        let mut ticker = tokio::time::interval(self.cfg.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let utilization = self.queue.utilization();
                    let current = self.worker_count();
                    let result = match scaler.observe(utilization, current, &self.cfg, Instant::now()) {
                        ScaleDecision::Up => {
                            info!(utilization, workers = current + 1, "scaling worker pool up");
                            self.spawn_worker()
                        }
                        ScaleDecision::Down => {
                            info!(utilization, workers = current - 1, "scaling worker pool down");
                            self.retire_worker()
                        }
                        ScaleDecision::Hold => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "worker pool scaling failed");
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<T: Clone + Send + Sync + 'static> LoadSource for WorkerPool<T> {
    fn queue_utilization(&self) -> f64 {
        self.inner.queue.utilization()
    }

    fn worker_saturation(&self) -> f64 {
        self.inner.saturation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::FailureClass;
    use crate::queue::dead_letter::InMemoryDeadLetterSink;
    use crate::queue::task_queue::QueueConfig;

    fn pool_with<H: TaskHandler<u32> + 'static>(
        handler: H,
        cfg: PoolConfig,
    ) -> (WorkerPool<u32>, Arc<InMemoryDeadLetterSink<u32>>) {
        let queue = Arc::new(TaskQueue::new(QueueConfig::new().with_max_size(10)));
        let sink = Arc::new(InMemoryDeadLetterSink::new(16));
        let pool = WorkerPool::new(queue, Arc::new(handler), cfg)
            .with_dead_letter_sink(sink.clone());
        (pool, sink)
    }

    struct Flaky {
        succeed_on: u32,
        attempts: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl TaskHandler<u32> for Flaky {
        async fn handle(&self, ctx: TaskContext, _payload: u32) -> Result<()> {
            self.attempts.lock().unwrap().push(ctx.attempt);
            if ctx.attempt < self.succeed_on {
                Err(Error::dependency(FailureClass::Timeout, "slow dependency"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = PoolConfig::new()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(350));
        assert_eq!(cfg.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_scaler_requires_sustained_watermark() {
        let cfg = PoolConfig::new()
            .with_workers(1, 3)
            .with_watermarks(0.2, 0.8)
            .with_scale_sustain(Duration::from_secs(2));
        let mut scaler = Scaler::default();
        let t0 = Instant::now();
        let s = Duration::from_secs;

        assert_eq!(scaler.observe(0.9, 1, &cfg, t0), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.9, 1, &cfg, t0 + s(1)), ScaleDecision::Hold);
        // a dip resets the interval
        assert_eq!(scaler.observe(0.5, 1, &cfg, t0 + s(2)), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.9, 1, &cfg, t0 + s(3)), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.9, 1, &cfg, t0 + s(5)), ScaleDecision::Up);
        // next step needs a fresh interval
        assert_eq!(scaler.observe(0.9, 2, &cfg, t0 + s(6)), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.9, 2, &cfg, t0 + s(8)), ScaleDecision::Up);
        // at max: hold
        assert_eq!(scaler.observe(0.9, 3, &cfg, t0 + s(9)), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.9, 3, &cfg, t0 + s(20)), ScaleDecision::Hold);

        assert_eq!(scaler.observe(0.0, 3, &cfg, t0 + s(21)), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.0, 3, &cfg, t0 + s(23)), ScaleDecision::Down);
        assert_eq!(scaler.observe(0.0, 1, &cfg, t0 + s(30)), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.0, 1, &cfg, t0 + s(40)), ScaleDecision::Hold);
    }

    #[test]
    fn test_scaler_wakes_empty_pool_for_backlog() {
        let cfg = PoolConfig::new().with_workers(0, 2);
        let mut scaler = Scaler::default();
        let t0 = Instant::now();
        assert_eq!(scaler.observe(0.0, 0, &cfg, t0), ScaleDecision::Hold);
        assert_eq!(scaler.observe(0.1, 0, &cfg, t0), ScaleDecision::Up);
        assert_eq!(scaler.observe(0.1, 1, &cfg, t0), ScaleDecision::Hold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_min_workers_still_drains_backlog() {
        let handler =
            handler_fn(|_ctx: TaskContext, _payload: u32| async { Ok::<(), Error>(()) });
        let cfg = PoolConfig::new()
            .with_workers(0, 2)
            .with_sample_interval(Duration::from_millis(100));
        let (pool, sink) = pool_with(handler, cfg);
        for n in 0..5 {
            pool.enqueue(n, Priority::Normal, None).await.unwrap();
        }
        pool.start().unwrap();
        assert_eq!(pool.worker_count(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.snapshot().completed, 5);
        assert_eq!(pool.queue().len(), 0);
        assert!(sink.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_tasks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            handler_fn(move |_ctx: TaskContext, payload: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(payload);
                    Ok::<(), Error>(())
                }
            })
        };
        let (pool, sink) = pool_with(handler, PoolConfig::new().with_workers(1, 1));
        for n in 1..=3 {
            pool.enqueue(n, Priority::Normal, None).await.unwrap();
        }
        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(pool.snapshot().completed, 3);
        assert!(sink.is_empty());
        pool.shutdown().await;
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeeds() {
        let handler = Flaky {
            succeed_on: 3,
            attempts: Mutex::new(Vec::new()),
        };
        let cfg = PoolConfig::new()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        let queue = Arc::new(TaskQueue::new(QueueConfig::new()));
        let handler = Arc::new(handler);
        let pool = WorkerPool::new(queue, handler.clone(), cfg);
        pool.start().unwrap();
        pool.enqueue(1, Priority::High, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*handler.attempts.lock().unwrap(), vec![1]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*handler.attempts.lock().unwrap(), vec![1, 2]);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*handler.attempts.lock().unwrap(), vec![1, 2, 3]);

        let snap = pool.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.retried, 2);
        assert_eq!(snap.failed_attempts, 2);
        assert_eq!(snap.dead_lettered, 0);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_into_dead_letter() {
        let handler = handler_fn(|_ctx: TaskContext, _payload: u32| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), Error>(())
        });
        let cfg = PoolConfig::new()
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(10));
        let (pool, sink) = pool_with(handler, cfg);
        pool.start().unwrap();
        let id = pool
            .enqueue(9, Priority::Normal, Some(Duration::from_millis(100)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_id, id);
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].reason, DeadLetterReason::AttemptsExhausted);
        assert_eq!(letters[0].payload, 9);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_dead_letters_at_once() {
        let handler = handler_fn(|_ctx: TaskContext, _payload: u32| async {
            Err::<(), _>(Error::business("order already closed"))
        });
        let (pool, sink) = pool_with(handler, PoolConfig::new().with_max_attempts(5));
        pool.start().unwrap();
        pool.enqueue(1, Priority::Normal, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert_eq!(
            letters[0].reason,
            DeadLetterReason::NonRetryable(FailureClass::Business)
        );
        assert_eq!(pool.snapshot().retried, 0);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_dead_letters_queued_and_retrying_tasks() {
        let handler = handler_fn(|_ctx: TaskContext, payload: u32| async move {
            if payload == 0 {
                return Err(Error::dependency(FailureClass::Connection, "refused"));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), Error>(())
        });
        let cfg = PoolConfig::new()
            .with_workers(1, 1)
            .with_backoff(Duration::from_secs(1), Duration::from_secs(1));
        let (pool, sink) = pool_with(handler, cfg);
        for n in 0..5 {
            pool.enqueue(n, Priority::Normal, None).await.unwrap();
        }
        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;

        let snap = pool.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.dead_lettered, 4);
        assert!(pool.queue().is_empty());

        let letters = sink.letters();
        assert_eq!(letters.len(), 4);
        assert!(letters
            .iter()
            .all(|l| l.reason == DeadLetterReason::QueueClosed));
        let mut payloads: Vec<u32> = letters.iter().map(|l| l.payload).collect();
        payloads.sort_unstable();
        assert_eq!(payloads, vec![0, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_counts_as_failed_attempt() {
        let handler = handler_fn(|ctx: TaskContext, _payload: u32| async move {
            if ctx.attempt == 1 {
                panic!("handler bug");
            }
            Ok::<(), Error>(())
        });
        let cfg = PoolConfig::new()
            .with_workers(1, 1)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(10));
        let (pool, sink) = pool_with(handler, cfg);
        pool.start().unwrap();
        pool.enqueue(1, Priority::Normal, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = pool.snapshot();
        assert_eq!(snap.failed_attempts, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.busy_workers, 0);
        assert_eq!(pool.worker_count(), 1);
        assert!(sink.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scales_up_under_sustained_load() {
        let handler = handler_fn(|_ctx: TaskContext, _payload: u32| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), Error>(())
        });
        let cfg = PoolConfig::new()
            .with_workers(1, 3)
            .with_watermarks(0.2, 0.5)
            .with_scale_sustain(Duration::from_secs(2))
            .with_sample_interval(Duration::from_millis(500));
        let (pool, _sink) = pool_with(handler, cfg);
        for n in 0..10 {
            pool.enqueue(n, Priority::Normal, Some(Duration::from_secs(7200)))
                .await
                .unwrap();
        }
        pool.start().unwrap();
        assert_eq!(pool.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(pool.worker_count(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.snapshot().busy_workers, 3);
        assert!((pool.worker_saturation() - 1.0).abs() < f64::EPSILON);
    }
}
