//! Bounded priority task queue.

use crate::telemetry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

pub type TaskId = String;

/// Priority class. Higher classes are always dequeued first; FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    fn lane(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// What `enqueue` does when the queue is at `max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Fail immediately with [`Error::QueueFull`].
    Reject,
    /// Wait for room up to the block timeout, then fail with [`Error::QueueFull`].
    Block,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub full_policy: FullPolicy,
    /// Default wait for producers under [`FullPolicy::Block`].
    pub block_timeout: Duration,
    /// Execution timeout for tasks enqueued without one.
    pub default_task_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            full_policy: FullPolicy::Reject,
            block_timeout: Duration::from_secs(5),
            default_task_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_full_policy(mut self, policy: FullPolicy) -> Self {
        self.full_policy = policy;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }
}

/// A task from enqueue until it completes, fails terminally or is dead-lettered.
#[derive(Debug, Clone)]
pub struct QueueEntry<T> {
    pub id: TaskId,
    pub payload: T,
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Execution timeout for each attempt.
    pub timeout: Duration,
    /// Attempts made so far.
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub by_priority: Vec<(Priority, usize)>,
    pub enqueued_total: u64,
    pub rejected_total: u64,
    pub closed: bool,
}

struct Inner<T> {
    lanes: [VecDeque<QueueEntry<T>>; 4],
    len: usize,
    closed: bool,
}

impl<T> Inner<T> {
    fn pop(&mut self) -> Option<QueueEntry<T>> {
        for p in Priority::ALL {
            if let Some(entry) = self.lanes[p.lane()].pop_front() {
                self.len -= 1;
                return Some(entry);
            }
        }
        None
    }
}

/// Bounded multi-producer / multi-consumer queue.
pub struct TaskQueue<T> {
    cfg: QueueConfig,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
    enqueued: AtomicU64,
    rejected: AtomicU64,
}

impl<T> TaskQueue<T> {
    pub fn new(cfg: QueueConfig) -> Self {
        telemetry::record_queue(0, cfg.max_size);
        Self {
            cfg,
            inner: Mutex::new(Inner {
                lanes: std::array::from_fn(|_| VecDeque::new()),
                len: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// Enqueue under the configured full-queue policy.
    ///
    /// `timeout` is the per-attempt execution timeout; `None` uses the queue default.
    pub async fn enqueue(
        &self,
        payload: T,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<TaskId> {
        match self.cfg.full_policy {
            FullPolicy::Reject => self.try_enqueue(payload, priority, timeout),
            FullPolicy::Block => {
                self.enqueue_wait(payload, priority, timeout, self.cfg.block_timeout)
                    .await
            }
        }
    }

    /// Enqueue without waiting, whatever the configured policy.
    pub fn try_enqueue(
        &self,
        payload: T,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<TaskId> {
        let entry = self.new_entry(payload, priority, timeout);
        let id = entry.id.clone();
        match self.push_entry(entry) {
            Ok(()) => Ok(id),
            Err((err, _)) => {
                if matches!(err, Error::QueueFull { .. }) {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    /// Enqueue, waiting up to `max_wait` for room.
    pub async fn enqueue_wait(
        &self,
        payload: T,
        priority: Priority,
        timeout: Option<Duration>,
        max_wait: Duration,
    ) -> Result<TaskId> {
        let deadline = Instant::now() + max_wait;
        let mut entry = self.new_entry(payload, priority, timeout);
        let id = entry.id.clone();
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.push_entry(entry) {
                Ok(()) => return Ok(id),
                Err((Error::QueueFull { max_size }, back)) => {
                    entry = back;
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(max_size, "enqueue timed out waiting for room");
                        return Err(Error::QueueFull { max_size });
                    }
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    fn new_entry(&self, payload: T, priority: Priority, timeout: Option<Duration>) -> QueueEntry<T> {
        QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            priority,
            enqueued_at: Instant::now(),
            timeout: timeout.unwrap_or(self.cfg.default_task_timeout),
            attempt_count: 0,
        }
    }

    /// Push an entry, handing it back when it does not fit.
    ///
    /// Used directly by the worker pool to requeue retries.
    pub(crate) fn push_entry(
        &self,
        entry: QueueEntry<T>,
    ) -> std::result::Result<(), (Error, QueueEntry<T>)> {
        let size = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return Err((Error::poisoned("task_queue"), entry)),
            };
            if inner.closed {
                return Err((Error::QueueClosed, entry));
            }
            if inner.len >= self.cfg.max_size {
                return Err((
                    Error::QueueFull {
                        max_size: self.cfg.max_size,
                    },
                    entry,
                ));
            }
            inner.lanes[entry.priority.lane()].push_back(entry);
            inner.len += 1;
            inner.len
        };
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        telemetry::record_queue(size, self.cfg.max_size);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the next entry without waiting.
    pub fn try_dequeue(&self) -> Option<QueueEntry<T>> {
        let (entry, size) = {
            let mut inner = self.inner.lock().ok()?;
            let entry = inner.pop()?;
            (entry, inner.len)
        };
        telemetry::record_queue(size, self.cfg.max_size);
        self.not_full.notify_one();
        Some(entry)
    }

    /// Wait for the next entry. Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<QueueEntry<T>> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_dequeue() {
                return Some(entry);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting work and wake every waiter.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.closed).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.cfg.max_size
    }

    /// queue_depth / max_size
    pub fn utilization(&self) -> f64 {
        if self.cfg.max_size == 0 {
            return 1.0;
        }
        self.len() as f64 / self.cfg.max_size as f64
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let (size, by_priority, closed) = match self.inner.lock() {
            Ok(inner) => (
                inner.len,
                Priority::ALL
                    .iter()
                    .map(|p| (*p, inner.lanes[p.lane()].len()))
                    .collect(),
                inner.closed,
            ),
            Err(_) => (0, Vec::new(), true),
        };
        QueueSnapshot {
            size,
            max_size: self.cfg.max_size,
            utilization: if self.cfg.max_size == 0 {
                1.0
            } else {
                size as f64 / self.cfg.max_size as f64
            },
            by_priority,
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
            closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(max: usize, policy: FullPolicy) -> TaskQueue<&'static str> {
        TaskQueue::new(QueueConfig::new().with_max_size(max).with_full_policy(policy))
    }

    #[tokio::test]
    async fn test_bounded_fifo() {
        let q = queue(3, FullPolicy::Reject);
        for name in ["A", "B", "C"] {
            q.enqueue(name, Priority::Normal, None).await.unwrap();
        }
        let err = q.enqueue("D", Priority::Normal, None).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull { max_size: 3 }));

        let order: Vec<_> = (0..3).map(|_| q.try_dequeue().unwrap().payload).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(q.try_dequeue().is_none());
        assert_eq!(q.snapshot().rejected_total, 1);
    }

    #[tokio::test]
    async fn test_priority_classes() {
        let q = queue(10, FullPolicy::Reject);
        q.try_enqueue("low-1", Priority::Low, None).unwrap();
        q.try_enqueue("normal-1", Priority::Normal, None).unwrap();
        q.try_enqueue("critical-1", Priority::Critical, None).unwrap();
        q.try_enqueue("normal-2", Priority::Normal, None).unwrap();
        q.try_enqueue("high-1", Priority::High, None).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| q.try_dequeue().map(|e| e.payload)).collect();
        assert_eq!(order, vec!["critical-1", "high-1", "normal-1", "normal-2", "low-1"]);
    }

    #[tokio::test]
    async fn test_default_and_explicit_timeouts() {
        let q = TaskQueue::new(
            QueueConfig::new().with_default_task_timeout(Duration::from_secs(7)),
        );
        q.try_enqueue(1u8, Priority::Normal, None).unwrap();
        q.try_enqueue(2u8, Priority::Normal, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(q.try_dequeue().unwrap().timeout, Duration::from_secs(7));
        let second = q.try_dequeue().unwrap();
        assert_eq!(second.timeout, Duration::from_millis(50));
        assert_eq!(second.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_for_room() {
        let q = Arc::new(queue(1, FullPolicy::Block));
        q.try_enqueue("first", Priority::Normal, None).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.enqueue_wait("second", Priority::Normal, None, Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.try_dequeue().unwrap().payload, "first");

        let id = producer.await.unwrap().unwrap();
        let entry = q.try_dequeue().unwrap();
        assert_eq!(entry.payload, "second");
        assert_eq!(entry.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_times_out() {
        let q = queue(1, FullPolicy::Block);
        q.try_enqueue("first", Priority::Normal, None).unwrap();
        let start = Instant::now();
        let err = q
            .enqueue_wait("second", Priority::Normal, None, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { .. }));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue_and_close() {
        let q = Arc::new(queue(4, FullPolicy::Reject));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue().await.map(|e| e.payload) })
        };
        tokio::task::yield_now().await;
        q.try_enqueue("work", Priority::Normal, None).unwrap();
        assert_eq!(consumer.await.unwrap(), Some("work"));

        let idle = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue().await.map(|e| e.payload) })
        };
        tokio::task::yield_now().await;
        q.close();
        assert_eq!(idle.await.unwrap(), None);
        assert!(matches!(
            q.try_enqueue("late", Priority::Normal, None),
            Err(Error::QueueClosed)
        ));
    }

    #[test]
    fn test_utilization() {
        let q = queue(4, FullPolicy::Reject);
        q.try_enqueue("a", Priority::Normal, None).unwrap();
        assert!((q.utilization() - 0.25).abs() < f64::EPSILON);
        let snap = q.snapshot();
        assert_eq!(snap.size, 1);
        assert_eq!(snap.max_size, 4);
    }
}
