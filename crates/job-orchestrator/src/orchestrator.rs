use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use approval_gate::{ApprovalDecision, ApprovalGate, ApprovalRequest, GateError, GateStats};
use batch_scheduler::{
    BatchOptions, BatchScheduler, BatchSpec, ConfidenceAnalyzer, ExecutionMode,
};
use browser_adapter::DriverFactory;
use completion_detector::DetectorConfig;
use promptpilot_core_types::{
    ApprovalId, BatchId, BatchStatus, Job, JobId, JobStatus, Task, TaskId,
};
use promptpilot_event_bus::{emit, EventBus, EventKind, PilotEvent};

use crate::analyzer::TextGenAnalyzer;
use crate::error::OrchestratorError;
use crate::textgen::TextGenerationClient;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const LIST_HISTORY_LIMIT: usize = 10;
const DEFAULT_WINDOW_SIZE: usize = 3;

/// Everything needed to create a job.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub name: String,
    pub description: String,
    pub target_url: String,
    pub prompts: Vec<String>,
    pub oversight_enabled: bool,
    pub step_by_step: bool,
    pub approval_threshold: f64,
    pub options: BatchOptions,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            target_url: target_url.into(),
            prompts: Vec::new(),
            oversight_enabled: false,
            step_by_step: false,
            approval_threshold: 0.8,
            options: BatchOptions::default(),
        }
    }

    pub fn with_prompts<I, S>(mut self, prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prompts = prompts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_oversight(mut self, enabled: bool) -> Self {
        self.oversight_enabled = enabled;
        self
    }

    pub fn with_step_by_step(mut self, enabled: bool) -> Self {
        self.step_by_step = enabled;
        self
    }

    pub fn with_approval_threshold(mut self, threshold: f64) -> Self {
        self.approval_threshold = threshold;
        self
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Final summary returned by [`Orchestrator::run_job`].
#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub approval_requests: usize,
    pub human_interventions: usize,
}

impl JobReport {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            total: job.tasks.len(),
            completed: job.completed_count(),
            failed: job.failed_count(),
            approval_requests: job
                .tasks
                .iter()
                .map(|t| t.approval_requests.len())
                .sum(),
            human_interventions: job.tasks.iter().map(|t| t.interventions.len()).sum(),
        }
    }
}

/// Point-in-time view of a job, served for both active and archived jobs.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub approval_requests: usize,
    pub interventions: usize,
    /// Mean of per-task max confidence, over analyzed tasks.
    pub avg_confidence: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatusView {
    fn from_job(job: &Job) -> Self {
        let analyzed: Vec<f64> = job
            .tasks
            .iter()
            .filter(|t| !t.confidence.is_empty())
            .map(|t| t.max_confidence())
            .collect();
        let avg_confidence = if analyzed.is_empty() {
            0.0
        } else {
            analyzed.iter().sum::<f64>() / analyzed.len() as f64
        };
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            status: job.status,
            total: job.tasks.len(),
            completed: job.completed_count(),
            failed: job.failed_count(),
            approval_requests: job
                .tasks
                .iter()
                .map(|t| t.approval_requests.len())
                .sum(),
            interventions: job.tasks.iter().map(|t| t.interventions.len()).sum(),
            avg_confidence,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Aggregate health across the orchestrator's collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub text_generation: bool,
    pub browser: bool,
    pub pending_approvals: usize,
    pub gate: GateStats,
    pub active_jobs: usize,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.text_generation && self.browser
    }
}

/// Per-job settings that do not live on the core `Job` record.
#[derive(Clone)]
struct JobSettings {
    target_url: String,
    options: BatchOptions,
}

/// Owns the full job lifecycle from creation to archived history.
pub struct Orchestrator {
    scheduler: Arc<BatchScheduler>,
    gate: Arc<ApprovalGate>,
    textgen: Arc<dyn TextGenerationClient>,
    factory: Arc<dyn DriverFactory>,
    bus: Option<Arc<dyn EventBus<PilotEvent>>>,
    detector: DetectorConfig,
    jobs: DashMap<JobId, Job>,
    settings: DashMap<JobId, JobSettings>,
    batches: DashMap<JobId, BatchId>,
    history: Mutex<VecDeque<Job>>,
    history_limit: usize,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        textgen: Arc<dyn TextGenerationClient>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self::with_detector_config(factory, textgen, gate, DetectorConfig::default())
    }

    pub fn with_detector_config(
        factory: Arc<dyn DriverFactory>,
        textgen: Arc<dyn TextGenerationClient>,
        gate: Arc<ApprovalGate>,
        detector: DetectorConfig,
    ) -> Self {
        let analyzer: Arc<dyn ConfidenceAnalyzer> =
            Arc::new(TextGenAnalyzer::new(Arc::clone(&textgen)));
        let scheduler = Arc::new(
            BatchScheduler::new(Arc::clone(&factory), Arc::clone(&gate), analyzer)
                .with_detector_config(detector.clone()),
        );
        Self {
            scheduler,
            gate,
            textgen,
            factory,
            bus: None,
            detector,
            jobs: DashMap::new(),
            settings: DashMap::new(),
            batches: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus<PilotEvent>>) -> Self {
        // The scheduler publishes batch and task events on the same bus.
        let analyzer: Arc<dyn ConfidenceAnalyzer> =
            Arc::new(TextGenAnalyzer::new(Arc::clone(&self.textgen)));
        self.scheduler = Arc::new(
            BatchScheduler::new(
                Arc::clone(&self.factory),
                Arc::clone(&self.gate),
                analyzer,
            )
            .with_detector_config(self.detector.clone())
            .with_bus(Arc::clone(&bus)),
        );
        self.bus = Some(bus);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Register a job. Jobs with no prompts are rejected so a finished job
    /// always has at least one task behind its terminal status.
    pub async fn create_job(&self, spec: JobSpec) -> Result<Job, OrchestratorError> {
        if spec.prompts.is_empty() {
            return Err(OrchestratorError::InvalidState(
                "job has no prompts".to_string(),
            ));
        }

        let id = JobId::new();
        let tasks: Vec<Task> = spec
            .prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| Task::new(TaskId::derived(&id, index), prompt.clone(), "auto"))
            .collect();
        let job = Job {
            id: id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            tasks,
            status: JobStatus::Queued,
            oversight_enabled: spec.oversight_enabled,
            step_by_step: spec.step_by_step,
            approval_threshold: spec.approval_threshold,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.settings.insert(
            id.clone(),
            JobSettings {
                target_url: spec.target_url,
                options: spec.options,
            },
        );
        self.jobs.insert(id.clone(), job.clone());

        info!(
            target: "orchestrator",
            job_id = %id,
            name = %job.name,
            tasks = job.tasks.len(),
            oversight = job.oversight_enabled,
            "job created"
        );
        self.emit_event(
            EventKind::JobCreated,
            json!({
                "job_id": id.to_string(),
                "name": job.name,
                "tasks": job.tasks.len(),
            }),
        )
        .await;
        Ok(job)
    }

    /// Run a queued job to a terminal status and archive it. The execution
    /// mode follows the job's oversight settings: step-by-step wins, then
    /// windowed-parallel under oversight, otherwise sequential.
    pub async fn run_job(&self, job_id: &JobId) -> Result<JobReport, OrchestratorError> {
        let (batch_spec, tasks) = self.prepare_run(job_id)?;
        self.emit_event(EventKind::JobStarted, json!({"job_id": job_id.to_string()}))
            .await;
        self.batches.insert(job_id.clone(), batch_spec.id.clone());

        let run = self.scheduler.run_batch(batch_spec, tasks).await;
        self.batches.remove(job_id);

        match run {
            Ok(report) => {
                let job = {
                    let mut entry = self
                        .jobs
                        .get_mut(job_id)
                        .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
                    let job = entry.value_mut();
                    job.tasks = report.tasks;
                    job.completed_at = Some(Utc::now());
                    job.status = if report.status == BatchStatus::Cancelled {
                        JobStatus::Stopped
                    } else {
                        job.terminal_status()
                    };
                    job.clone()
                };
                self.retire(job_id);
                self.archive(job.clone());

                let kind = if job.status == JobStatus::Stopped {
                    EventKind::JobStopped
                } else {
                    EventKind::JobCompleted
                };
                info!(
                    target: "orchestrator",
                    job_id = %job_id,
                    status = ?job.status,
                    completed = job.completed_count(),
                    failed = job.failed_count(),
                    "job finished"
                );
                self.emit_event(
                    kind,
                    json!({
                        "job_id": job_id.to_string(),
                        "status": job.status,
                        "completed": job.completed_count(),
                        "failed": job.failed_count(),
                    }),
                )
                .await;
                Ok(JobReport::from_job(&job))
            }
            Err(err) => {
                warn!(target: "orchestrator", job_id = %job_id, error = %err, "job run failed");
                if let Some(mut entry) = self.jobs.get_mut(job_id) {
                    let job = entry.value_mut();
                    job.status = JobStatus::Error;
                    job.completed_at = Some(Utc::now());
                }
                if let Some((_, job)) = self.jobs.remove(job_id) {
                    self.archive(job);
                }
                self.settings.remove(job_id);
                self.emit_event(
                    EventKind::JobError,
                    json!({"job_id": job_id.to_string(), "error": err.to_string()}),
                )
                .await;
                Err(err.into())
            }
        }
    }

    pub async fn pause_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        {
            let mut entry = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
            let job = entry.value_mut();
            if job.status != JobStatus::Running {
                return Err(OrchestratorError::InvalidState(format!(
                    "job {} is {:?}, not running",
                    job_id, job.status
                )));
            }
            job.status = JobStatus::Paused;
        }
        if let Some(batch_id) = self.batch_for(job_id) {
            self.scheduler.pause(&batch_id)?;
        }
        self.emit_event(EventKind::JobPaused, json!({"job_id": job_id.to_string()}))
            .await;
        Ok(())
    }

    pub async fn resume_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        {
            let mut entry = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
            let job = entry.value_mut();
            if job.status != JobStatus::Paused {
                return Err(OrchestratorError::InvalidState(format!(
                    "job {} is {:?}, not paused",
                    job_id, job.status
                )));
            }
            job.status = JobStatus::Running;
        }
        if let Some(batch_id) = self.batch_for(job_id) {
            self.scheduler.resume(&batch_id)?;
        }
        self.emit_event(EventKind::JobResumed, json!({"job_id": job_id.to_string()}))
            .await;
        Ok(())
    }

    /// Stop a job. A running job has its batch torn down (the in-flight run
    /// finalizes it as Stopped); a queued job is archived directly.
    pub async fn stop_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        if let Some(batch_id) = self.batch_for(job_id) {
            self.scheduler.stop(&batch_id).await?;
            return Ok(());
        }
        let (_, mut job) = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        job.status = JobStatus::Stopped;
        job.completed_at = Some(Utc::now());
        self.settings.remove(job_id);
        self.archive(job);
        self.emit_event(EventKind::JobStopped, json!({"job_id": job_id.to_string()}))
            .await;
        Ok(())
    }

    /// Status of an active or archived job.
    pub fn get_status(&self, job_id: &JobId) -> Result<JobStatusView, OrchestratorError> {
        if let Some(job) = self.jobs.get(job_id) {
            return Ok(JobStatusView::from_job(job.value()));
        }
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .find(|job| &job.id == job_id)
            .map(JobStatusView::from_job)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))
    }

    /// All active jobs plus the most recent archived ones.
    pub fn list_jobs(&self) -> Vec<JobStatusView> {
        let mut views: Vec<JobStatusView> = self
            .jobs
            .iter()
            .map(|entry| JobStatusView::from_job(entry.value()))
            .collect();
        views.sort_by_key(|v| v.created_at);
        let history = self.history.lock();
        views.extend(
            history
                .iter()
                .rev()
                .take(LIST_HISTORY_LIMIT)
                .map(JobStatusView::from_job),
        );
        views
    }

    /// Pass a human decision through to the gate. Decisions arrive as strings
    /// from the operator surface.
    pub async fn respond_to_approval(
        &self,
        approval_id: &ApprovalId,
        decision: &str,
        reasoning: Option<String>,
        modifications: Option<Value>,
    ) -> Result<ApprovalRequest, OrchestratorError> {
        let decision = match decision.to_ascii_lowercase().as_str() {
            "approve" | "approved" => ApprovalDecision::Approve,
            "reject" | "rejected" => ApprovalDecision::Reject,
            other => {
                return Err(OrchestratorError::Gate(GateError::InvalidDecision(
                    other.to_string(),
                )))
            }
        };
        let record = self
            .gate
            .respond_to_approval(approval_id, decision, reasoning, modifications)
            .await?;
        Ok(record)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gate.pending()
    }

    /// Aggregate health across text generation, browser automation and the
    /// approval gate.
    pub async fn health_check(&self) -> HealthReport {
        let text_generation = self.textgen.health_check().await;
        let browser = match self.factory.create().await {
            Ok(driver) => {
                let healthy = driver.health_check().await;
                if let Err(err) = driver.cleanup().await {
                    warn!(target: "orchestrator", error = %err, "health probe cleanup failed");
                }
                healthy
            }
            Err(err) => {
                warn!(target: "orchestrator", error = %err, "browser health probe failed");
                false
            }
        };
        HealthReport {
            text_generation,
            browser,
            pending_approvals: self.gate.pending().len(),
            gate: self.gate.stats(),
            active_jobs: self.jobs.len(),
        }
    }

    /// Cancel anything still running and clear every registry.
    pub async fn shutdown(&self) {
        let batch_ids: Vec<BatchId> = self
            .batches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for batch_id in batch_ids {
            if let Err(err) = self.scheduler.stop(&batch_id).await {
                warn!(target: "orchestrator", batch_id = %batch_id, error = %err, "shutdown stop failed");
            }
        }
        self.batches.clear();
        self.jobs.clear();
        self.settings.clear();
        self.history.lock().clear();
        info!(target: "orchestrator", "shut down");
    }

    fn prepare_run(&self, job_id: &JobId) -> Result<(BatchSpec, Vec<Task>), OrchestratorError> {
        let settings = self
            .settings
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        let job = entry.value_mut();
        if job.status != JobStatus::Queued {
            return Err(OrchestratorError::InvalidState(format!(
                "job {} is {:?}, not queued",
                job_id, job.status
            )));
        }
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());

        let mode = if job.step_by_step {
            ExecutionMode::StepByStep
        } else if job.oversight_enabled {
            ExecutionMode::WindowedParallel {
                window_size: DEFAULT_WINDOW_SIZE,
            }
        } else {
            ExecutionMode::Sequential
        };
        let mut options = settings.options;
        if job.oversight_enabled || job.step_by_step {
            options.approval_threshold = Some(job.approval_threshold);
        }

        let mut batch_spec = BatchSpec::new(job.name.clone(), settings.target_url)
            .with_prompts(job.tasks.iter().map(|t| t.prompt.clone()))
            .with_mode(mode)
            .with_options(options);
        batch_spec.agent_id = job_id.to_string();

        info!(
            target: "orchestrator",
            job_id = %job_id,
            mode = ?mode,
            "job starting"
        );
        Ok((batch_spec, job.tasks.clone()))
    }

    fn batch_for(&self, job_id: &JobId) -> Option<BatchId> {
        self.batches.get(job_id).map(|entry| entry.value().clone())
    }

    fn retire(&self, job_id: &JobId) {
        self.jobs.remove(job_id);
        self.settings.remove(job_id);
    }

    fn archive(&self, job: Job) {
        let mut history = self.history.lock();
        history.push_back(job);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    async fn emit_event(&self, kind: EventKind, payload: Value) {
        if let Some(bus) = &self.bus {
            emit(bus.as_ref(), kind, payload).await;
        }
    }
}
