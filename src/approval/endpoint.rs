//! HTTP-agnostic handler for `POST /approval/respond`.
//!
//! The host server owns routing and transport; it hands the decoded body (or
//! the raw bytes) here and writes back the status code and JSON body.

use super::gate::{ApprovalGate, ApprovalResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondRequest {
    pub run_id: String,
    pub approved: bool,
    #[serde(default)]
    pub modified_data: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespondStatus {
    Accepted,
    NotFound,
    BadRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondResponse {
    pub status: RespondStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RespondResponse {
    fn status(status: RespondStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

/// `200 {status: accepted}` when the run was pending, `404 {status: not_found}` otherwise.
pub fn handle_respond(gate: &ApprovalGate, req: RespondRequest) -> (u16, RespondResponse) {
    let response = ApprovalResponse {
        approved: req.approved,
        modified_data: req.modified_data,
        reason: req.reason,
    };
    if gate.respond_to_approval(&req.run_id, response) {
        (200, RespondResponse::status(RespondStatus::Accepted))
    } else {
        (404, RespondResponse::status(RespondStatus::NotFound))
    }
}

/// Decode a raw JSON body first; malformed bodies get `400 {status: bad_request}`.
pub fn handle_respond_body(gate: &ApprovalGate, body: &[u8]) -> (u16, RespondResponse) {
    match serde_json::from_slice::<RespondRequest>(body) {
        Ok(req) => handle_respond(gate, req),
        Err(e) => (
            400,
            RespondResponse {
                status: RespondStatus::BadRequest,
                error: Some(e.to_string()),
            },
        ),
    }
}
