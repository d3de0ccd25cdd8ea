use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ApprovalId, BatchId, JobId, TaskId};
use crate::status::{BatchStatus, JobStatus, TaskStatus};

/// One prompt submission and its lifecycle. Owned by its job; mutated only by
/// the scheduler and orchestrator while the job runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub prompt: String,
    pub target_platform: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub approval_requests: Vec<ApprovalId>,
    pub interventions: Vec<Intervention>,
    pub confidence: HashMap<String, f64>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, prompt: impl Into<String>, target_platform: impl Into<String>) -> Self {
        Self {
            id,
            prompt: prompt.into(),
            target_platform: target_platform.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            approval_requests: Vec::new(),
            interventions: Vec::new(),
            confidence: HashMap::new(),
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Highest confidence score recorded across analysis dimensions, used for
    /// job-level aggregate statistics.
    pub fn max_confidence(&self) -> f64 {
        self.confidence
            .values()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0)
    }
}

/// A recorded human intervention on a task (e.g. a prompt modification
/// applied as part of an approval response).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intervention {
    pub kind: String,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl Intervention {
    pub fn new(kind: impl Into<String>, detail: Value) -> Self {
        Self {
            kind: kind.into(),
            detail,
            at: Utc::now(),
        }
    }
}

/// Top-level unit of work: an ordered sequence of tasks plus oversight
/// configuration. Exclusively owned by the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub status: JobStatus,
    pub oversight_enabled: bool,
    pub step_by_step: bool,
    pub approval_threshold: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count()
    }

    /// Terminal status for a finished run: completed only when nothing failed
    /// and at least one task ran.
    pub fn terminal_status(&self) -> JobStatus {
        let failed = self.failed_count();
        let completed = self.completed_count();
        if failed == 0 && !self.tasks.is_empty() {
            JobStatus::Completed
        } else if completed > 0 {
            JobStatus::PartialSuccess
        } else {
            JobStatus::Failed
        }
    }
}

/// Live projection of a batch run, recomputed after every task resolution.
/// Safe to read concurrently with the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percent: f64,
    pub current_action: String,
    pub last_updated: DateTime<Utc>,
}

impl BatchProgress {
    pub fn new(batch_id: BatchId, total: usize) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            percent: 0.0,
            current_action: "queued".to_string(),
            last_updated: Utc::now(),
        }
    }

    /// Count one resolved task and recompute the percentage. The percentage
    /// only ever grows within a run.
    pub fn record_resolution(&mut self, succeeded: bool, action: impl Into<String>) {
        if succeeded {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let resolved = self.completed + self.failed;
        if self.total > 0 {
            self.percent = resolved as f64 * 100.0 / self.total as f64;
        }
        self.current_action = action.into();
        self.last_updated = Utc::now();
    }

    pub fn touch(&mut self, action: impl Into<String>) {
        self.current_action = action.into();
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_statuses(statuses: &[TaskStatus]) -> Job {
        let id = JobId::new();
        let tasks = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut task = Task::new(TaskId::derived(&id, i), "p", "generic");
                task.status = *status;
                task
            })
            .collect();
        Job {
            id,
            name: "test".into(),
            description: String::new(),
            tasks,
            status: JobStatus::Running,
            oversight_enabled: false,
            step_by_step: false,
            approval_threshold: 0.8,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn terminal_status_rules() {
        use TaskStatus::*;
        assert_eq!(
            job_with_statuses(&[Completed, Completed]).terminal_status(),
            JobStatus::Completed
        );
        assert_eq!(
            job_with_statuses(&[Completed, Failed]).terminal_status(),
            JobStatus::PartialSuccess
        );
        assert_eq!(
            job_with_statuses(&[Failed, Failed]).terminal_status(),
            JobStatus::Failed
        );
    }

    #[test]
    fn progress_percent_is_monotonic() {
        let mut progress = BatchProgress::new(BatchId::new(), 4);
        let mut last = 0.0;
        for i in 0..4 {
            progress.record_resolution(i % 2 == 0, format!("prompt {}", i));
            assert!(progress.percent >= last);
            last = progress.percent;
        }
        assert!((progress.percent - 100.0).abs() < 1e-9);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failed, 2);
    }

    #[test]
    fn max_confidence_handles_empty_map() {
        let task = Task::new(TaskId::new(), "p", "generic");
        assert_eq!(task.max_confidence(), 0.0);
    }
}
