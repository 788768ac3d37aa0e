//! API request and response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::TaskStatus;

/// Response of `GET /quota`.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaResponse {
    /// Masked API key
    pub api_key: String,

    /// Current credit balance
    pub credits: u64,
}

/// Request to redeem a code.
#[derive(Debug, Clone, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

/// Response after a successful redemption.
#[derive(Debug, Clone, Serialize)]
pub struct RedeemResponse {
    pub message: String,
    pub code: String,
    pub credits_added: u64,
    pub credits_total: u64,
    /// Masked API key
    pub api_key: String,
}

/// Request to submit a new verification task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// Verification id or a verification URL carrying one
    pub verification_id: String,
}

/// Response after creating a task.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    /// Unique task identifier
    pub task_id: Uuid,

    /// Always `pending` at creation
    pub status: TaskStatus,

    pub message: String,
}

/// Request to run a batch of verifications synchronously.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub verification_ids: Vec<String>,
}

/// Request to cancel work for a verification id.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub verification_id: String,
}

/// Request to mint redemption codes.
#[derive(Debug, Clone, Deserialize)]
pub struct MintCodesRequest {
    pub count: usize,
    pub credits: u64,
}

/// Minted redemption codes.
#[derive(Debug, Clone, Serialize)]
pub struct MintCodesResponse {
    pub credits: u64,
    pub codes: Vec<String>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Tasks not yet in a terminal state
    pub active_tasks: usize,
}
