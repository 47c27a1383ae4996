//! 缓存模块：为降级回退保存最近一次成功结果。
//!
//! # Last-Known-Good Cache Module
//!
//! TTL-bounded storage behind the `Cached` fallback strategy: successful
//! primary results are written here, and served while fresh when the primary
//! is skipped or fails.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | Typed get/set with TTL and statistics |
//! | [`CacheConfig`] | TTL, size limit and key prefix |
//! | [`CacheBackend`] | Trait for byte stores |
//! | [`MemoryCache`] | In-memory backend with LRU eviction |
//! | [`NullCache`] | No-op backend |
//!
//! ## Example
//!
//! ```rust
//! use reliability_plane::cache::{CacheConfig, CacheManager, MemoryCache};
//! use std::time::Duration;
//!
//! let cache = CacheManager::new(
//!     CacheConfig::new().with_ttl(Duration::from_secs(60)),
//!     Box::new(MemoryCache::new(1000)),
//! );
//! assert_eq!(cache.backend_name(), "memory");
//! ```

mod backend;
mod manager;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use manager::{CacheConfig, CacheManager, CacheStats};
