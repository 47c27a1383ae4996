//! Dead-letter sinks for tasks that exhausted their attempts.

use super::task_queue::{Priority, TaskId};
use crate::error_code::FailureClass;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Why a task ended up in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// `max_attempts` reached.
    AttemptsExhausted,
    /// The failure was not retryable.
    NonRetryable(FailureClass),
    /// Retry could not re-enter the queue because it was full.
    QueueFull,
    /// The pool shut down before the task could run or re-enter the queue.
    QueueClosed,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::AttemptsExhausted => write!(f, "attempts exhausted"),
            DeadLetterReason::NonRetryable(class) => write!(f, "non-retryable {}", class),
            DeadLetterReason::QueueFull => write!(f, "queue full on retry"),
            DeadLetterReason::QueueClosed => write!(f, "queue closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub task_id: TaskId,
    pub payload: T,
    pub priority: Priority,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    /// Message of the last failure.
    pub last_error: String,
    /// Time spent between first enqueue and dead-lettering.
    pub age: Duration,
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink<T>: Send + Sync {
    async fn deliver(&self, letter: DeadLetter<T>) -> Result<()>;
}

/// Drops dead letters.
pub struct NoopDeadLetterSink;

#[async_trait]
impl<T: Send + 'static> DeadLetterSink<T> for NoopDeadLetterSink {
    async fn deliver(&self, _letter: DeadLetter<T>) -> Result<()> {
        Ok(())
    }
}

/// Logs dead letters at `warn`. The pool's default sink.
pub struct LoggingDeadLetterSink {
    target: String,
}

impl LoggingDeadLetterSink {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Default for LoggingDeadLetterSink {
    fn default() -> Self {
        Self::new("worker_pool")
    }
}

#[async_trait]
impl<T: Send + 'static> DeadLetterSink<T> for LoggingDeadLetterSink {
    async fn deliver(&self, letter: DeadLetter<T>) -> Result<()> {
        warn!(
            sink = %self.target,
            task_id = %letter.task_id,
            attempts = letter.attempts,
            reason = %letter.reason,
            error = %letter.last_error,
            "task dead-lettered"
        );
        Ok(())
    }
}

/// Keeps the most recent `max` dead letters in memory.
pub struct InMemoryDeadLetterSink<T> {
    letters: Arc<RwLock<Vec<DeadLetter<T>>>>,
    max_letters: usize,
}

impl<T: Clone> InMemoryDeadLetterSink<T> {
    pub fn new(max: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters: max,
        }
    }

    pub fn letters(&self) -> Vec<DeadLetter<T>> {
        self.letters.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut letters) = self.letters.write() {
            letters.clear();
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DeadLetterSink<T> for InMemoryDeadLetterSink<T> {
    async fn deliver(&self, letter: DeadLetter<T>) -> Result<()> {
        let mut letters = self
            .letters
            .write()
            .map_err(|_| Error::poisoned("dead_letter_sink"))?;
        letters.push(letter);
        if letters.len() > self.max_letters {
            letters.remove(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(id: &str) -> DeadLetter<u32> {
        DeadLetter {
            task_id: id.to_string(),
            payload: 7,
            priority: Priority::Normal,
            attempts: 3,
            reason: DeadLetterReason::AttemptsExhausted,
            last_error: "boom".into(),
            age: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryDeadLetterSink::new(2);
        for id in ["a", "b", "c"] {
            sink.deliver(letter(id)).await.unwrap();
        }
        let ids: Vec<_> = sink.letters().into_iter().map(|l| l.task_id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_logging_and_noop_sinks_accept() {
        LoggingDeadLetterSink::default()
            .deliver(letter("x"))
            .await
            .unwrap();
        NoopDeadLetterSink.deliver(letter("y")).await.unwrap();
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DeadLetterReason::NonRetryable(FailureClass::InvalidRequest).to_string(),
            format!("non-retryable {}", FailureClass::InvalidRequest)
        );
    }
}
