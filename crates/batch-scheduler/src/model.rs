use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use promptpilot_core_types::{BatchId, BatchStatus, Task};

/// One prompt to submit, with the action type it is reviewed under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptSpec {
    pub text: String,
    pub action_type: String,
}

impl PromptSpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action_type: "execute_task".to_string(),
        }
    }
}

/// How the prompts of a batch are walked.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One prompt at a time, no approvals.
    Sequential,
    /// Human approval before every prompt.
    StepByStep,
    /// Fixed windows: approvals for the whole window up front, then the
    /// approved prompts execute concurrently and the window joins before the
    /// next one starts.
    WindowedParallel { window_size: usize },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::WindowedParallel { window_size: 3 }
    }
}

/// Tuning for a single batch run.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Bound for each approval wait; gate policy default when `None`.
    pub approval_timeout: Option<Duration>,
    /// When false, prompts are submitted without waiting for the target to
    /// finish generating.
    pub wait_for_completion: bool,
    /// Pause between consecutive prompt submissions.
    pub settle_between_prompts: Duration,
    /// Job-level override of the gate's auto-approval threshold.
    pub approval_threshold: Option<f64>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(3),
            approval_timeout: None,
            wait_for_completion: true,
            settle_between_prompts: Duration::from_secs(2),
            approval_threshold: None,
        }
    }
}

/// Everything a batch run needs up front.
#[derive(Clone, Debug)]
pub struct BatchSpec {
    pub id: BatchId,
    pub name: String,
    pub agent_id: String,
    pub target_url: String,
    pub prompts: Vec<PromptSpec>,
    pub mode: ExecutionMode,
    pub options: BatchOptions,
}

impl BatchSpec {
    pub fn new(name: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: BatchId::new(),
            name: name.into(),
            agent_id: "promptpilot".to_string(),
            target_url: target_url.into(),
            prompts: Vec::new(),
            mode: ExecutionMode::default(),
            options: BatchOptions::default(),
        }
    }

    pub fn with_prompts<I, S>(mut self, prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prompts = prompts.into_iter().map(PromptSpec::new).collect();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Final outcome of a batch run, carrying the mutated tasks back to the
/// caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub tasks: Vec<Task>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == promptpilot_core_types::TaskStatus::Completed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == promptpilot_core_types::TaskStatus::Failed)
            .count()
    }
}
