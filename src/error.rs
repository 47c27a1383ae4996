use crate::degradation::DegradationLevel;
use crate::error_code::FailureClass;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "breaker.failure_threshold")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_validator", "approval_gate")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the reliability control plane.
///
/// Admission-style variants (`CircuitOpen`, `RateLimited`, `QueueFull`) are
/// recoverable from the caller's point of view and carry enough data to back off.
#[derive(Debug, Error)]
pub enum Error {
    #[error("circuit breaker '{name}' is open (retry after {}ms)", .retry_after.as_millis())]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("rate limit exceeded for '{key}'{}", format_retry_after(.retry_after))]
    RateLimited {
        key: String,
        retry_after: Option<Duration>,
    },

    #[error("queue is full (max_size {max_size})")]
    QueueFull { max_size: usize },

    #[error("queue is closed")]
    QueueClosed,

    #[error("task {task_id} timed out after {}ms", .timeout.as_millis())]
    TaskTimeout { task_id: String, timeout: Duration },

    #[error("dependency error ({class}): {message}")]
    Dependency { class: FailureClass, message: String },

    #[error("feature '{feature}' is unavailable at service level {level}")]
    FeatureUnavailable {
        feature: String,
        level: DegradationLevel,
    },

    #[error("feature '{feature}' failed: primary: {primary}; fallback: {fallback}")]
    FallbackFailed {
        feature: String,
        primary: Box<Error>,
        fallback: Box<Error>,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Error raised by a dependency call, tagged with its failure class.
    pub fn dependency(class: FailureClass, msg: impl Into<String>) -> Self {
        Error::Dependency {
            class,
            message: msg.into(),
        }
    }

    /// Shorthand for a business-rule rejection from a healthy dependency.
    pub fn business(msg: impl Into<String>) -> Self {
        Self::dependency(FailureClass::Business, msg)
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Error for a poisoned instance lock.
    pub(crate) fn poisoned(source: &'static str) -> Self {
        Error::runtime_with_context(
            "state lock poisoned",
            ErrorContext::new().with_source(source),
        )
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Reduce any error to its failure class.
    ///
    /// Breakers and the worker pool decide qualification and retries on this
    /// value alone.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::Dependency { class, .. } => *class,
            Error::TaskTimeout { .. } => FailureClass::Timeout,
            Error::CircuitOpen { .. } => FailureClass::Overloaded,
            Error::RateLimited { .. } | Error::QueueFull { .. } => FailureClass::RateLimited,
            Error::QueueClosed => FailureClass::Cancelled,
            Error::FeatureUnavailable { .. } => FailureClass::Overloaded,
            Error::FallbackFailed { primary, .. } => primary.failure_class(),
            Error::Configuration { .. } | Error::Validation { .. } => FailureClass::InvalidRequest,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => FailureClass::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe => FailureClass::Connection,
                _ => FailureClass::Unknown,
            },
            Error::Runtime { .. } | Error::Serialization(_) | Error::Yaml(_) => {
                FailureClass::Unknown
            }
        }
    }

    /// Suggested wait before retrying, for admission-style errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "must be greater than zero",
            ErrorContext::new()
                .with_field_path("breaker.failure_threshold")
                .with_source("config_validator"),
        );
        let msg = err.to_string();
        assert!(msg.contains("field: breaker.failure_threshold"));
        assert!(msg.contains("source: config_validator"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_failure_class_of_io_errors() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(err.failure_class(), FailureClass::Connection);
        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.failure_class(), FailureClass::Timeout);
    }

    #[test]
    fn test_fallback_failed_keeps_primary_class() {
        let err = Error::FallbackFailed {
            feature: "search".into(),
            primary: Box::new(Error::dependency(FailureClass::ServerError, "500")),
            fallback: Box::new(Error::business("no cached value")),
        };
        assert_eq!(err.failure_class(), FailureClass::ServerError);
        assert!(err.to_string().contains("primary"));
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::RateLimited {
            key: "tenant-a".into(),
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert!(err.to_string().contains("1500ms"));
        assert_eq!(Error::QueueClosed.retry_after(), None);
    }
}
