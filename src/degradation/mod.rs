//! 降级模块：管理全局服务等级并按功能分派回退策略。
//!
//! # Graceful Degradation Module
//!
//! Owns the single service level and decides, per feature, whether a call
//! runs its primary path or is redirected to a fallback.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`DegradationLevel`] | `Full` → `Degraded` → `Minimal` → `Maintenance` |
//! | [`DegradationManager`] | Level state, feature registry, `execute_with_fallback` |
//! | [`FallbackStrategy`] | `Cached`, `Static` or `Service` |
//!
//! ## Level transitions
//!
//! Backpressure signals move the level one step at a time and are
//! sequence-numbered, so replaying a signal is harmless. An operator override
//! pins the level until cleared.
//!
//! ```rust
//! use reliability_plane::degradation::{DegradationLevel, DegradationManager, FallbackStrategy, FeatureSpec, Signal};
//! use reliability_plane::resilience::BreakerRegistry;
//! use std::sync::Arc;
//!
//! let manager = DegradationManager::new(Arc::new(BreakerRegistry::default()));
//! manager
//!     .register_feature(
//!         "recommendations",
//!         FeatureSpec::new(DegradationLevel::Full).with_fallback(FallbackStrategy::fixed(serde_json::json!([]))),
//!     )
//!     .unwrap();
//! manager.apply_signal(Signal::Degrade, 1).unwrap();
//! assert!(!manager.is_available("recommendations"));
//! ```

pub mod fallback;
pub mod level;
pub mod manager;

pub use fallback::{FallbackService, FallbackStrategy};
pub use level::{DegradationLevel, Signal};
pub use manager::{DegradationManager, DegradationSnapshot, FallbackOutcomes, FeatureSpec};
