//! 故障分类：定义依赖调用失败的标准类别及其熔断/重试语义。
//!
//! Failure classification for guarded dependency calls.
//!
//! Every error that crosses a reliability boundary is reduced to a
//! [`FailureClass`]. The class decides whether the failure counts against a
//! circuit breaker, whether a queued task may be retried, and which label is
//! attached to emitted metrics.
//!
//! ## Class Categories
//!
//! | Prefix | Category    | Description                                   |
//! |--------|-------------|-----------------------------------------------|
//! | E1xxx  | client      | Caller-side errors (never trip a breaker)     |
//! | E2xxx  | rate        | Admission / quota rejections                  |
//! | E3xxx  | dependency  | Unhealthy or unreachable dependency           |
//! | E4xxx  | operational | Lifecycle and state conflicts                 |
//! | E5xxx  | business    | Healthy dependency answered "no"              |
//! | E9xxx  | unknown     | Catch-all / unclassified                      |
//!
//! ## Example
//!
//! ```rust
//! use reliability_plane::error_code::FailureClass;
//!
//! let class = FailureClass::from_http_status(503);
//! assert_eq!(class.code(), "E3004");
//! assert!(class.retryable());
//! assert_eq!(class.category(), "dependency");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical failure class of a guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// E1001: Malformed input or missing fields
    InvalidRequest,
    /// E1002: Missing or rejected credentials
    Authentication,
    /// E1003: Requested resource does not exist
    NotFound,
    /// E2001: Rejected by an admission limit
    RateLimited,
    /// E3001: Call did not complete in time
    Timeout,
    /// E3002: Dependency unreachable (refused, reset, DNS)
    Connection,
    /// E3003: Dependency answered with a 5xx-equivalent
    ServerError,
    /// E3004: Dependency reports it is overloaded
    Overloaded,
    /// E4001: State conflict (e.g., concurrent modification)
    Conflict,
    /// E4002: Caller cancelled the operation
    Cancelled,
    /// E5001: Business rule rejection from a healthy dependency
    Business,
    /// E9999: Could not be classified
    Unknown,
}

impl FailureClass {
    /// Returns the canonical code string (e.g., `"E3001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "E1001",
            Self::Authentication => "E1002",
            Self::NotFound => "E1003",
            Self::RateLimited => "E2001",
            Self::Timeout => "E3001",
            Self::Connection => "E3002",
            Self::ServerError => "E3003",
            Self::Overloaded => "E3004",
            Self::Conflict => "E4001",
            Self::Cancelled => "E4002",
            Self::Business => "E5001",
            Self::Unknown => "E9999",
        }
    }

    /// Returns the snake_case name used in config files and metric labels.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::ServerError => "server_error",
            Self::Overloaded => "overloaded",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Business => "business",
            Self::Unknown => "unknown",
        }
    }

    /// Returns whether a queued task failing with this class may be retried.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::Timeout
                | Self::Connection
                | Self::ServerError
                | Self::Overloaded
                | Self::Conflict
                | Self::Unknown
        )
    }

    /// Returns whether the class says something about dependency health.
    ///
    /// This is the default tripping set for circuit breakers.
    #[inline]
    pub fn indicates_unhealthy_dependency(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::ServerError | Self::Overloaded
        )
    }

    /// Returns the category: `"client"`, `"rate"`, `"dependency"`, `"operational"`,
    /// `"business"`, or `"unknown"`.
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest | Self::Authentication | Self::NotFound => "client",
            Self::RateLimited => "rate",
            Self::Timeout | Self::Connection | Self::ServerError | Self::Overloaded => {
                "dependency"
            }
            Self::Conflict | Self::Cancelled => "operational",
            Self::Business => "business",
            Self::Unknown => "unknown",
        }
    }

    /// Maps a class name to a `FailureClass`.
    ///
    /// Common aliases (`"timed_out"`, `"connection_refused"`, `"unavailable"`) are
    /// accepted. Unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let class = match name {
            "invalid_request" => Self::InvalidRequest,
            "authentication" | "unauthorized" => Self::Authentication,
            "not_found" => Self::NotFound,
            "rate_limited" | "rate_limit_exceeded" => Self::RateLimited,
            "timeout" | "timed_out" => Self::Timeout,
            "connection" | "connection_refused" | "connection_reset" => Self::Connection,
            "server_error" => Self::ServerError,
            "overloaded" | "unavailable" => Self::Overloaded,
            "conflict" => Self::Conflict,
            "cancelled" | "canceled" => Self::Cancelled,
            "business" => Self::Business,
            "unknown" => Self::Unknown,
            _ => return None,
        };
        Some(class)
    }

    /// Maps an HTTP status code to the most likely class.
    ///
    /// 4xx statuses other than 408/409/429 are treated as caller errors; every
    /// 5xx status is a dependency failure.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest,
            401 | 403 => Self::Authentication,
            404 => Self::NotFound,
            408 | 504 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            502 | 503 | 529 => Self::Overloaded,
            500..=599 => Self::ServerError,
            400..=499 => Self::Business,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tripping_set() {
        let tripping: Vec<_> = [
            FailureClass::Timeout,
            FailureClass::Connection,
            FailureClass::ServerError,
            FailureClass::Overloaded,
        ]
        .to_vec();
        for class in &tripping {
            assert!(class.indicates_unhealthy_dependency(), "{:?}", class);
        }
        for class in [
            FailureClass::Business,
            FailureClass::InvalidRequest,
            FailureClass::NotFound,
            FailureClass::RateLimited,
            FailureClass::Cancelled,
        ] {
            assert!(!class.indicates_unhealthy_dependency(), "{:?}", class);
        }
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(FailureClass::from_http_status(503), FailureClass::Overloaded);
        assert_eq!(FailureClass::from_http_status(500), FailureClass::ServerError);
        assert_eq!(FailureClass::from_http_status(507), FailureClass::ServerError);
        assert_eq!(FailureClass::from_http_status(504), FailureClass::Timeout);
        assert_eq!(FailureClass::from_http_status(402), FailureClass::Business);
        assert_eq!(FailureClass::from_http_status(200), FailureClass::Unknown);
    }

    #[test]
    fn test_name_round_trip_and_aliases() {
        assert_eq!(FailureClass::from_name("timed_out"), Some(FailureClass::Timeout));
        assert_eq!(
            FailureClass::from_name(FailureClass::Connection.name()),
            Some(FailureClass::Connection)
        );
        assert_eq!(FailureClass::from_name("nope"), None);
    }

    #[test]
    fn test_business_is_not_retryable() {
        assert!(!FailureClass::Business.retryable());
        assert!(FailureClass::Timeout.retryable());
        assert_eq!(FailureClass::Business.to_string(), "E5001");
    }
}
