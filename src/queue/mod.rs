//! 任务队列模块：有界优先级队列与弹性工作池。
//!
//! # Queue & Worker Pool Module
//!
//! Bounded buffering of work plus elastic worker capacity.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TaskQueue`] | Bounded MPMC queue, FIFO within a priority class |
//! | [`WorkerPool`] | Workers with per-task timeout, retry with backoff, watermark scaling |
//! | [`DeadLetterSink`] | Destination for tasks that exhausted their attempts |
//!
//! ## Lifecycle of a task
//!
//! 1. `enqueue` admits it or fails with [`Error::QueueFull`](crate::Error::QueueFull)
//!    (immediately, or after waiting under [`FullPolicy::Block`])
//! 2. a worker runs the handler under the task's own timeout
//! 3. a retryable failure re-enters the queue after `base_backoff * 2^(attempt-1)`
//! 4. after `max_attempts`, or on a non-retryable failure, the task is dead-lettered
//!
//! ```rust,no_run
//! use reliability_plane::queue::{handler_fn, PoolConfig, Priority, QueueConfig, TaskContext, TaskQueue, WorkerPool};
//! use std::sync::Arc;
//!
//! # async fn demo() -> reliability_plane::Result<()> {
//! let queue = Arc::new(TaskQueue::new(QueueConfig::new().with_max_size(100)));
//! let handler = handler_fn(|ctx: TaskContext, doc: String| async move {
//!     tracing::info!(task = %ctx.task_id, %doc, "indexing");
//!     Ok::<(), reliability_plane::Error>(())
//! });
//! let pool = WorkerPool::new(queue, Arc::new(handler), PoolConfig::new().with_workers(2, 8));
//! pool.start()?;
//! pool.enqueue("doc-1".to_string(), Priority::High, None).await?;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod dead_letter;
pub mod task_queue;
pub mod worker_pool;

pub use dead_letter::{
    DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink,
    NoopDeadLetterSink,
};
pub use task_queue::{FullPolicy, Priority, QueueConfig, QueueEntry, QueueSnapshot, TaskId, TaskQueue};
pub use worker_pool::{handler_fn, FnHandler, PoolConfig, PoolSnapshot, TaskContext, TaskHandler, WorkerPool};
