//! 人工审批模块：挂起调用方直到人工响应或超时。
//!
//! # Approval Gate Module
//!
//! Request/await primitive for human-in-the-loop decisions.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ApprovalGate`] | Pending map of correlation id → single-assignment resolver |
//! | [`handle_respond`] | Transport-independent `POST /approval/respond` handler |
//!
//! Only the requesting task is suspended. A timeout is a normal outcome: the
//! gate synthesizes `{approved: false, reason: "timeout"}`. State is held in
//! memory only.
//!
//! ```rust
//! use reliability_plane::approval::{ApprovalConfig, ApprovalGate, ApprovalResponse, ApprovalStatus};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> reliability_plane::Result<()> {
//! let gate = Arc::new(ApprovalGate::new(ApprovalConfig::new()));
//! let responder = Arc::clone(&gate);
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//!     responder.respond_to_approval("run-42", ApprovalResponse::approve());
//! });
//! let outcome = gate
//!     .request_approval("run-42", serde_json::json!({"action": "refund"}), Some(Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(outcome.status, ApprovalStatus::Approved);
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod gate;

pub use endpoint::{handle_respond, handle_respond_body, RespondRequest, RespondResponse, RespondStatus};
pub use gate::{
    ApprovalConfig, ApprovalGate, ApprovalOutcome, ApprovalResponse, ApprovalStats, ApprovalStatus,
    PendingApproval,
};
