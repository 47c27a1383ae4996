//! Fallback strategies.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Alternate backend used by [`FallbackStrategy::Service`].
#[async_trait]
pub trait FallbackService: Send + Sync {
    async fn call(&self, feature: &str) -> Result<Value>;

    fn name(&self) -> &str {
        "service"
    }
}

/// What to serve when a feature's primary path is skipped or fails.
#[derive(Clone)]
pub enum FallbackStrategy {
    /// Last successful primary result, if younger than `ttl`.
    Cached { ttl: Duration },
    /// A constant.
    Static(Value),
    /// An alternate backend.
    Service(Arc<dyn FallbackService>),
}

impl FallbackStrategy {
    pub fn cached(ttl: Duration) -> Self {
        Self::Cached { ttl }
    }

    pub fn fixed(value: impl Into<Value>) -> Self {
        Self::Static(value.into())
    }

    pub fn service(service: impl FallbackService + 'static) -> Self {
        Self::Service(Arc::new(service))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cached { .. } => "cached",
            Self::Static(_) => "static",
            Self::Service(_) => "service",
        }
    }
}

impl fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached { ttl } => f.debug_struct("Cached").field("ttl", ttl).finish(),
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Service(svc) => f.debug_tuple("Service").field(&svc.name()).finish(),
        }
    }
}
