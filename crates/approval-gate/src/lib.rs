//! Confidence-scored human-in-the-loop checkpoint.
//!
//! Actions flow through [`ApprovalGate::request_approval`]; policy decides
//! whether they auto-approve or wait for a human. Waits resolve exactly once
//! to a terminal record — human response, auto-approval or timeout — and a
//! timeout is itself a resolution, not an error.

pub mod errors;
pub mod gate;
pub mod policy;
pub mod types;

pub use errors::GateError;
pub use gate::{ApprovalGate, GateStats};
pub use policy::GatePolicy;
pub use types::{
    ApprovalDecision, ApprovalParams, ApprovalRequest, ApprovalResponse, ApprovalStatus,
    ResponseSource,
};
