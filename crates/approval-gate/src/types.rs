use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use promptpilot_core_types::{ApprovalId, ConfidenceLevel, TaskId};

/// Resolution state of an approval request. A request leaves `Pending` at
/// most once and never re-enters it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Timeout => "timeout",
        }
    }
}

/// A human response can only approve or reject; timeouts are produced by the
/// gate itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    pub fn status(self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        }
    }
}

/// Who resolved the request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Human,
    Auto,
    Timeout,
}

/// Resolution payload attached to a resolved request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub source: ResponseSource,
    pub reasoning: String,
    pub modifications: Option<Value>,
}

/// Inputs to [`crate::ApprovalGate::request_approval`].
#[derive(Clone, Debug)]
pub struct ApprovalParams {
    pub task_id: TaskId,
    pub agent_id: String,
    pub action_type: String,
    pub description: String,
    pub context: Value,
    pub confidence: f64,
    /// Per-request override of the policy auto-approval threshold (a job may
    /// carry its own).
    pub threshold: Option<f64>,
    pub screenshot: Option<Vec<u8>>,
}

/// One approval request and its eventual resolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub task_id: TaskId,
    pub agent_id: String,
    pub action_type: String,
    pub description: String,
    pub context: Value,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response: Option<ApprovalResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Vec<u8>>,
}

impl ApprovalRequest {
    pub fn new(params: ApprovalParams) -> Self {
        Self {
            id: ApprovalId::new(),
            confidence_level: ConfidenceLevel::from_score(params.confidence),
            task_id: params.task_id,
            agent_id: params.agent_id,
            action_type: params.action_type,
            description: params.description,
            context: params.context,
            confidence: params.confidence,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            response: None,
            screenshot: params.screenshot,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    pub fn auto_approved(&self) -> bool {
        matches!(
            self.response,
            Some(ApprovalResponse {
                source: ResponseSource::Auto,
                ..
            })
        )
    }

    pub(crate) fn resolve(&mut self, status: ApprovalStatus, response: ApprovalResponse) {
        self.status = status;
        self.responded_at = Some(Utc::now());
        self.response = Some(response);
    }
}
