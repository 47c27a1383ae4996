//! Approval gate: suspend a task until a human responds or the deadline passes.

use crate::telemetry;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A human decision. Also the shape synthesized on timeout and cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            modified_data: None,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            modified_data: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_modified_data(mut self, data: Value) -> Self {
        self.modified_data = Some(data);
        self
    }

    pub fn timeout() -> Self {
        Self::reject("timeout")
    }

    pub fn cancelled() -> Self {
        Self::reject("cancelled")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

/// Terminal result of one `request_approval` call.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub correlation_id: String,
    pub status: ApprovalStatus,
    pub response: ApprovalResponse,
    pub waited_ms: u64,
}

/// Operator view of a pending request.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub correlation_id: String,
    pub payload: Value,
    pub status: ApprovalStatus,
    pub age_ms: u64,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApprovalStats {
    pub pending: usize,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub late_responses: u64,
}

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Used when the caller passes no timeout.
    pub default_timeout: Duration,
    pub max_pending: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_pending: 10_000,
        }
    }
}

impl ApprovalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }
}

enum Resolution {
    Responded(ApprovalResponse),
    Cancelled,
}

struct Pending {
    payload: Value,
    created_at: Instant,
    deadline: Instant,
    resolver: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Counters {
    approved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    late_responses: AtomicU64,
}

/// Correlation id → single-assignment resolver.
///
/// Every resolution path removes the entry, so each id resolves exactly once.
pub struct ApprovalGate {
    cfg: ApprovalConfig,
    pending: Mutex<HashMap<String, Pending>>,
    counters: Counters,
}

/// Removes the entry if the waiting future is dropped before resolution.
struct PendingGuard<'a> {
    gate: &'a ApprovalGate,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.gate.take(self.correlation_id).is_some() {
            self.gate.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = self.correlation_id, "approval wait dropped");
        }
    }
}

impl ApprovalGate {
    pub fn new(cfg: ApprovalConfig) -> Self {
        Self {
            cfg,
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take(&self, correlation_id: &str) -> Option<Pending> {
        let mut pending = self.lock();
        let taken = pending.remove(correlation_id);
        if taken.is_some() {
            telemetry::record_approval_pending(pending.len());
        }
        taken
    }

    /// Register a request and wait for its resolution.
    ///
    /// Resolves with the human response, with `{approved: false, reason:
    /// "timeout"}` once `timeout` (or the configured default) elapses, or with
    /// status `Cancelled` after [`cancel`](Self::cancel). Fails only when the
    /// id is already pending or the gate is at capacity.
    pub async fn request_approval(
        &self,
        correlation_id: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<ApprovalOutcome> {
        let correlation_id = correlation_id.into();
        let timeout = timeout.unwrap_or(self.cfg.default_timeout);
        let created_at = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.contains_key(&correlation_id) {
                return Err(Error::validation_with_context(
                    format!("approval '{}' is already pending", correlation_id),
                    ErrorContext::new()
                        .with_field_path("correlation_id")
                        .with_source("approval_gate"),
                ));
            }
            if pending.len() >= self.cfg.max_pending {
                return Err(Error::validation_with_context(
                    "too many pending approvals",
                    ErrorContext::new()
                        .with_details(format!("max_pending = {}", self.cfg.max_pending))
                        .with_source("approval_gate"),
                ));
            }
            pending.insert(
                correlation_id.clone(),
                Pending {
                    payload,
                    created_at,
                    deadline: created_at + timeout,
                    resolver: tx,
                },
            );
            telemetry::record_approval_pending(pending.len());
        }
        debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "approval requested");

        let _guard = PendingGuard {
            gate: self,
            correlation_id: &correlation_id,
        };

        let resolution = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::Cancelled,
            Err(_) => {
                if self.take(&correlation_id).is_some() {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_approval_timeout();
                    info!(correlation_id = %correlation_id, "approval timed out");
                    return Ok(ApprovalOutcome {
                        correlation_id: correlation_id.clone(),
                        status: ApprovalStatus::TimedOut,
                        response: ApprovalResponse::timeout(),
                        waited_ms: created_at.elapsed().as_millis() as u64,
                    });
                }
                // a resolver took the entry first; it sends or drops the sender
                // right after releasing the lock
                rx.await.unwrap_or(Resolution::Cancelled)
            }
        };

        let (status, response) = match resolution {
            Resolution::Responded(response) if response.approved => {
                self.counters.approved.fetch_add(1, Ordering::Relaxed);
                (ApprovalStatus::Approved, response)
            }
            Resolution::Responded(response) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                (ApprovalStatus::Rejected, response)
            }
            Resolution::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                (ApprovalStatus::Cancelled, ApprovalResponse::cancelled())
            }
        };
        info!(correlation_id = %correlation_id, ?status, "approval resolved");
        Ok(ApprovalOutcome {
            correlation_id: correlation_id.clone(),
            status,
            response,
            waited_ms: created_at.elapsed().as_millis() as u64,
        })
    }

    /// Deliver a human response. Returns `false` (and changes nothing) when the
    /// id is unknown or already resolved.
    pub fn respond_to_approval(&self, correlation_id: &str, response: ApprovalResponse) -> bool {
        match self.take(correlation_id) {
            Some(pending) => {
                if pending.resolver.send(Resolution::Responded(response)).is_err() {
                    warn!(correlation_id, "approval waiter disappeared before response");
                }
                true
            }
            None => {
                self.counters.late_responses.fetch_add(1, Ordering::Relaxed);
                info!(correlation_id, "ignoring response for unknown or resolved approval");
                false
            }
        }
    }

    /// Resolve a pending request as `Cancelled`.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        match self.take(correlation_id) {
            Some(pending) => {
                let _ = pending.resolver.send(Resolution::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Pending requests, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let now = Instant::now();
        let pending = self.lock();
        let mut list: Vec<(Instant, PendingApproval)> = pending
            .iter()
            .map(|(id, p)| {
                (
                    p.created_at,
                    PendingApproval {
                        correlation_id: id.clone(),
                        payload: p.payload.clone(),
                        status: ApprovalStatus::Pending,
                        age_ms: now.saturating_duration_since(p.created_at).as_millis() as u64,
                        remaining_ms: p.deadline.saturating_duration_since(now).as_millis() as u64,
                    },
                )
            })
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.correlation_id.cmp(&b.1.correlation_id)));
        list.into_iter().map(|(_, p)| p).collect()
    }

    pub fn stats(&self) -> ApprovalStats {
        let c = &self.counters;
        ApprovalStats {
            pending: self.lock().len(),
            approved: c.approved.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            late_responses: c.late_responses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(ApprovalConfig::default())
    }
}
