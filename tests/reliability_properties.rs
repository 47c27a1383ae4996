//! End-to-end behavior of the control plane components.

use reliability_plane::approval::{ApprovalConfig, ApprovalGate, ApprovalResponse, ApprovalStatus};
use reliability_plane::backpressure::LoadSource;
use reliability_plane::degradation::{DegradationLevel, FallbackStrategy, Signal};
use reliability_plane::queue::{Priority, QueueConfig, TaskQueue};
use reliability_plane::resilience::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig,
    StrategyConfig,
};
use reliability_plane::{Error, FailureClass, ReliabilityConfig, ReliabilityPlane};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn timeout_error() -> Error {
    Error::dependency(FailureClass::Timeout, "dependency timed out")
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_and_probes() {
    let breaker = CircuitBreaker::new(
        "crm",
        CircuitBreakerConfig::new()
            .with_failure_threshold(5)
            .with_recovery_timeout(Duration::from_secs(30))
            .with_half_open_max_calls(2),
    );

    for _ in 0..5 {
        let result = breaker.call(|| async { Err::<(), _>(timeout_error()) }).await;
        assert!(matches!(result, Err(Error::Dependency { .. })));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let invoked = AtomicUsize::new(0);
    let counter = &invoked;
    let result = breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(30)).await;

    let first = breaker.allow().unwrap();
    let second = breaker.allow().unwrap();
    assert!(first.is_probe() && second.is_probe());
    assert!(matches!(breaker.allow(), Err(Error::CircuitOpen { .. })));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.on_success(first);
    breaker.on_success(second);
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_token_bucket_retry_hint() {
    let limiter = RateLimiter::new(
        RateLimiterConfig::new().with_default_strategy(StrategyConfig::token_bucket(10.0, 1.0)),
    );

    assert!(limiter.check("tenant", 10).unwrap().allowed);
    let denied = limiter.check("tenant", 1).unwrap();
    assert!(!denied.allowed);
    assert!(
        (990..=1010).contains(&denied.retry_after_ms),
        "retry_after_ms = {}",
        denied.retry_after_ms
    );

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(limiter.check("tenant", 1).unwrap().allowed);
}

#[test]
fn test_queue_capacity_and_fifo_order() {
    let queue = TaskQueue::new(QueueConfig::new().with_max_size(3));
    for payload in ["A", "B", "C"] {
        assert_ok!(queue.try_enqueue(payload, Priority::Normal, None));
    }
    let err = assert_err!(queue.try_enqueue("D", Priority::Normal, None));
    assert!(matches!(err, Error::QueueFull { max_size: 3 }));

    let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
        .map(|entry| entry.payload)
        .collect();
    assert_eq!(order, vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_approval_times_out() {
    let gate = ApprovalGate::new(ApprovalConfig::default());
    let started = Instant::now();
    let outcome = gate
        .request_approval("run-1", json!({"action": "refund"}), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_millis(5_010));
    assert_eq!(outcome.status, ApprovalStatus::TimedOut);
    assert!(!outcome.response.approved);
    assert_eq!(outcome.response.reason.as_deref(), Some("timeout"));
    assert!(!gate.is_pending("run-1"));
}

#[tokio::test(start_paused = true)]
async fn test_approval_early_response_wins() {
    let gate = Arc::new(ApprovalGate::new(ApprovalConfig::default()));
    let responder = Arc::clone(&gate);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(responder.respond_to_approval("run-2", ApprovalResponse::approve()));
    });

    let started = Instant::now();
    let outcome = gate
        .request_approval("run-2", json!({}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_millis(2_010));
    assert_eq!(outcome.status, ApprovalStatus::Approved);

    // the timeout never fires afterwards
    tokio::time::advance(Duration::from_secs(10)).await;
    let stats = gate.stats();
    assert_eq!(stats.approved, 1);
    assert_eq!(stats.timed_out, 0);
}

/// Load in percent, reported for both queue and workers.
struct Load(AtomicU64);

impl LoadSource for Load {
    fn queue_utilization(&self) -> f64 {
        self.0.load(Ordering::SeqCst) as f64 / 100.0
    }
    fn worker_saturation(&self) -> f64 {
        self.queue_utilization()
    }
}

#[test]
fn test_backpressure_degrades_once_then_restores() {
    let mut cfg = ReliabilityConfig::default();
    cfg.backpressure.rising_threshold = 0.4;
    cfg.backpressure.falling_threshold = 0.2;
    cfg.backpressure.rising_sustain_ms = 5_000;
    cfg.backpressure.falling_sustain_ms = 5_000;
    let plane = ReliabilityPlane::from_config(cfg).unwrap();
    let load = Arc::new(Load(AtomicU64::new(100)));
    plane.coordinator().attach(load.clone());

    let t0 = Instant::now();
    let mut signals = Vec::new();
    for s in 0..30 {
        signals.extend(plane.coordinator().tick(t0 + Duration::from_secs(s)).unwrap());
    }
    assert_eq!(signals, vec![Signal::Degrade]);
    assert_eq!(plane.degradation().level(), DegradationLevel::Degraded);

    load.0.store(0, Ordering::SeqCst);
    signals.clear();
    for s in 30..60 {
        signals.extend(plane.coordinator().tick(t0 + Duration::from_secs(s)).unwrap());
    }
    assert_eq!(signals, vec![Signal::Restore]);
    assert_eq!(plane.degradation().level(), DegradationLevel::Full);
}

#[tokio::test]
async fn test_fallback_served_while_breaker_open() {
    let mut cfg = ReliabilityConfig::default();
    cfg.breaker.defaults.failure_threshold = 1;
    let plane = ReliabilityPlane::from_config(cfg).unwrap();

    let _ = plane
        .call_with_breaker("x", || async { Err::<(), _>(timeout_error()) })
        .await;
    assert!(plane.breakers().is_open("x"));

    let invoked = AtomicUsize::new(0);
    let counter = &invoked;
    let value = plane
        .execute_with_fallback(
            "x",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("primary"))
            },
            Some(FallbackStrategy::fixed("fallback")),
        )
        .await
        .unwrap();

    assert_eq!(value, json!("fallback"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    let outcomes = plane.degradation().outcomes();
    assert_eq!(outcomes.fallback_invoked, 1);
    assert_eq!(outcomes.skipped_breaker_open, 1);
}

#[tokio::test]
async fn test_respond_endpoint_resolves_pending_request() {
    let plane = Arc::new(ReliabilityPlane::from_config(ReliabilityConfig::default()).unwrap());
    let waiter = Arc::clone(&plane);
    let pending = tokio::spawn(async move {
        waiter
            .request_approval("run-9", json!({"amount": 40}), Some(Duration::from_secs(60)))
            .await
    });

    while !plane.approvals().is_pending("run-9") {
        tokio::task::yield_now().await;
    }
    let body = br#"{"run_id": "run-9", "approved": false, "reason": "too large"}"#;
    let (code, response) =
        reliability_plane::approval::handle_respond_body(plane.approvals(), body);
    assert_eq!(code, 200);
    assert_eq!(serde_json::to_value(&response).unwrap(), json!({"status": "accepted"}));

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Rejected);
    assert_eq!(outcome.response.reason.as_deref(), Some("too large"));
}
