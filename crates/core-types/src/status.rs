use serde::{Deserialize, Serialize};

/// Job lifecycle: `Queued → Running → {Completed, PartialSuccess, Failed,
/// Error, Stopped}`, with `Running ⇄ Paused`. Terminal states are final; an
/// archived job never re-enters the active set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    PartialSuccess,
    Failed,
    Error,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::PartialSuccess
                | JobStatus::Failed
                | JobStatus::Error
                | JobStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Stopped => "stopped",
        }
    }
}

/// Task lifecycle: `Pending → Analyzing → Processing → {Completed, Failed}`.
/// A task may short-circuit `Pending → Failed` when its approval is rejected
/// or times out before execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Analyzing,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Batch lifecycle as seen at the scheduler level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
    Stopped,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            BatchStatus::Pending | BatchStatus::Running | BatchStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::PartialSuccess => "partial_success",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_job_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::PartialSuccess.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::PartialSuccess).unwrap();
        assert_eq!(json, "\"partial_success\"");
        let json = serde_json::to_string(&TaskStatus::Analyzing).unwrap();
        assert_eq!(json, "\"analyzing\"");
    }
}
