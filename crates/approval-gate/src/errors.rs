use thiserror::Error;

use promptpilot_core_types::{ApprovalId, TaskId};

/// Gate error enumeration. Business conditions, not panics: unknown ids and
/// invalid transitions are reported to the caller as typed failures.
#[derive(Debug, Error, Clone)]
pub enum GateError {
    /// Unknown id, or the request was already resolved.
    #[error("approval request {0} not found or already resolved")]
    NotFound(ApprovalId),

    /// A task may have at most one outstanding approval request.
    #[error("task {0} already has a pending approval request")]
    AlreadyPending(TaskId),

    /// Responses may only approve or reject.
    #[error("invalid approval decision: {0}")]
    InvalidDecision(String),
}
