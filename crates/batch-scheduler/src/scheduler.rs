use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use approval_gate::{
    ApprovalGate, ApprovalParams, ApprovalRequest, ApprovalStatus, GateError, ResponseSource,
};
use browser_adapter::{BrowserDriver, DriverFactory};
use completion_detector::{CompletionDetector, DetectorConfig, PlatformProfile};
use promptpilot_core_types::{
    BatchId, BatchProgress, BatchStatus, ConfidenceReport, Intervention, Task, TaskStatus,
};
use promptpilot_event_bus::{emit, EventBus, EventKind, PilotEvent};

use crate::analyzer::ConfidenceAnalyzer;
use crate::error::ScheduleError;
use crate::model::{BatchOptions, BatchReport, BatchSpec, ExecutionMode};

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Shared handle for a running batch: live progress plus the cooperative
/// pause/cancel flags checked at task and window boundaries.
struct BatchControl {
    progress: RwLock<BatchProgress>,
    paused: AtomicBool,
    cancelled: AtomicBool,
    driver: Mutex<Option<Arc<dyn BrowserDriver>>>,
}

impl BatchControl {
    fn new(progress: BatchProgress) -> Self {
        Self {
            progress: RwLock::new(progress),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_driver(&self, driver: Arc<dyn BrowserDriver>) {
        *self.driver.lock() = Some(driver);
    }

    fn take_driver(&self) -> Option<Arc<dyn BrowserDriver>> {
        self.driver.lock().take()
    }
}

/// Drives the prompts of a batch through one browser session.
///
/// Each run acquires a fresh driver from the factory, fingerprints the target
/// once and then walks the prompts in the requested execution mode. The
/// session is cleaned up on every exit path, including cancellation and
/// collaborator failure.
pub struct BatchScheduler {
    factory: Arc<dyn DriverFactory>,
    gate: Arc<ApprovalGate>,
    analyzer: Arc<dyn ConfidenceAnalyzer>,
    detector_config: DetectorConfig,
    bus: Option<Arc<dyn EventBus<PilotEvent>>>,
    controls: DashMap<BatchId, Arc<BatchControl>>,
}

impl BatchScheduler {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        gate: Arc<ApprovalGate>,
        analyzer: Arc<dyn ConfidenceAnalyzer>,
    ) -> Self {
        Self {
            factory,
            gate,
            analyzer,
            detector_config: DetectorConfig::default(),
            bus: None,
            controls: DashMap::new(),
        }
    }

    pub fn with_detector_config(mut self, config: DetectorConfig) -> Self {
        self.detector_config = config;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus<PilotEvent>>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawn the run onto the runtime; the handle resolves to the report.
    pub fn start(
        self: &Arc<Self>,
        spec: BatchSpec,
        tasks: Vec<Task>,
    ) -> tokio::task::JoinHandle<Result<BatchReport, ScheduleError>> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_batch(spec, tasks).await })
    }

    /// Run the batch to completion. Collaborator failures inside the run
    /// resolve into a failed report; `Err` is reserved for requests that
    /// never start (duplicate id, malformed spec).
    pub async fn run_batch(
        &self,
        spec: BatchSpec,
        mut tasks: Vec<Task>,
    ) -> Result<BatchReport, ScheduleError> {
        if tasks.len() != spec.prompts.len() {
            return Err(ScheduleError::InvalidState(format!(
                "{} tasks for {} prompts",
                tasks.len(),
                spec.prompts.len()
            )));
        }
        if self.controls.contains_key(&spec.id) {
            return Err(ScheduleError::AlreadyRunning(spec.id.clone()));
        }

        let control = Arc::new(BatchControl::new(BatchProgress::new(
            spec.id.clone(),
            tasks.len(),
        )));
        self.controls.insert(spec.id.clone(), Arc::clone(&control));
        let started_at = Utc::now();

        info!(
            target: "scheduler",
            batch_id = %spec.id,
            prompts = tasks.len(),
            mode = ?spec.mode,
            target_url = %spec.target_url,
            "batch starting"
        );
        self.emit_event(
            EventKind::BatchStarted,
            json!({
                "batch_id": spec.id.to_string(),
                "name": spec.name,
                "total": tasks.len(),
            }),
        )
        .await;
        control.progress.write().status = BatchStatus::Running;

        let run = self.run_inner(&spec, &mut tasks, &control).await;

        // Session teardown happens before anything else, on every path.
        if let Some(driver) = control.take_driver() {
            if let Err(err) = driver.cleanup().await {
                warn!(target: "scheduler", batch_id = %spec.id, error = %err, "session cleanup failed");
            }
        }

        if let Err(err) = &run {
            warn!(target: "scheduler", batch_id = %spec.id, error = %err, "batch run aborted");
            let message = err.to_string();
            for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                task.status = TaskStatus::Failed;
                task.error = Some(message.clone());
                control
                    .progress
                    .write()
                    .record_resolution(false, format!("failed {}", task.id));
            }
        }

        let status = final_status(&tasks, control.is_cancelled());
        {
            let mut progress = control.progress.write();
            progress.status = status;
            progress.touch("finished");
        }
        self.controls.remove(&spec.id);

        let finished_at = Utc::now();
        let report = BatchReport {
            batch_id: spec.id.clone(),
            status,
            tasks,
            started_at,
            finished_at,
        };
        info!(
            target: "scheduler",
            batch_id = %spec.id,
            status = ?status,
            completed = report.completed_count(),
            failed = report.failed_count(),
            "batch finished"
        );
        let kind = if status == BatchStatus::Cancelled {
            EventKind::BatchCancelled
        } else {
            EventKind::BatchCompleted
        };
        self.emit_event(
            kind,
            json!({
                "batch_id": spec.id.to_string(),
                "status": status,
                "completed": report.completed_count(),
                "failed": report.failed_count(),
            }),
        )
        .await;

        Ok(report)
    }

    pub fn pause(&self, batch_id: &BatchId) -> Result<(), ScheduleError> {
        let control = self.control(batch_id)?;
        control.paused.store(true, Ordering::SeqCst);
        info!(target: "scheduler", batch_id = %batch_id, "pause requested");
        Ok(())
    }

    pub fn resume(&self, batch_id: &BatchId) -> Result<(), ScheduleError> {
        let control = self.control(batch_id)?;
        control.paused.store(false, Ordering::SeqCst);
        info!(target: "scheduler", batch_id = %batch_id, "resume requested");
        Ok(())
    }

    /// Request cancellation. The in-flight prompt finishes; everything after
    /// the next boundary is skipped and stays `Pending`.
    pub fn cancel(&self, batch_id: &BatchId) -> Result<(), ScheduleError> {
        let control = self.control(batch_id)?;
        control.cancelled.store(true, Ordering::SeqCst);
        // A paused run must be released so it can wind down.
        control.paused.store(false, Ordering::SeqCst);
        info!(target: "scheduler", batch_id = %batch_id, "cancel requested");
        Ok(())
    }

    /// Cancel and tear the browser session down immediately rather than at
    /// the end of the run.
    pub async fn stop(&self, batch_id: &BatchId) -> Result<(), ScheduleError> {
        let control = self.control(batch_id)?;
        control.cancelled.store(true, Ordering::SeqCst);
        control.paused.store(false, Ordering::SeqCst);
        if let Some(driver) = control.take_driver() {
            if let Err(err) = driver.cleanup().await {
                warn!(target: "scheduler", batch_id = %batch_id, error = %err, "session cleanup failed");
            }
        }
        info!(target: "scheduler", batch_id = %batch_id, "batch stopped");
        Ok(())
    }

    /// Live progress snapshot; safe to call while the run executes.
    pub fn progress(&self, batch_id: &BatchId) -> Result<BatchProgress, ScheduleError> {
        let control = self.control(batch_id)?;
        let snapshot = control.progress.read().clone();
        Ok(snapshot)
    }

    fn control(&self, batch_id: &BatchId) -> Result<Arc<BatchControl>, ScheduleError> {
        self.controls
            .get(batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ScheduleError::BatchNotFound(batch_id.clone()))
    }

    async fn run_inner(
        &self,
        spec: &BatchSpec,
        tasks: &mut [Task],
        control: &Arc<BatchControl>,
    ) -> Result<(), ScheduleError> {
        control.progress.write().touch("acquiring browser session");
        let driver = self.factory.create().await?;
        // Store the session before initialize so teardown reaches it even
        // when initialization fails.
        control.set_driver(Arc::clone(&driver));
        driver.initialize().await?;

        control.progress.write().touch("navigating");
        driver.navigate(&spec.target_url).await?;

        let detector = CompletionDetector::new(Arc::clone(&driver), self.detector_config.clone());
        let profile = detector.detect_platform(&spec.target_url).await;
        for task in tasks.iter_mut() {
            task.target_platform = profile.platform.clone();
        }

        match spec.mode {
            ExecutionMode::Sequential => {
                self.run_sequential(spec, tasks, control, &driver, &detector, &profile)
                    .await
            }
            ExecutionMode::StepByStep => {
                self.run_step_by_step(spec, tasks, control, &driver, &detector, &profile)
                    .await
            }
            ExecutionMode::WindowedParallel { window_size } => {
                self.run_windowed(
                    window_size.max(1),
                    spec,
                    tasks,
                    control,
                    &driver,
                    &detector,
                    &profile,
                )
                .await
            }
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        spec: &BatchSpec,
        tasks: &mut [Task],
        control: &Arc<BatchControl>,
        driver: &Arc<dyn BrowserDriver>,
        detector: &CompletionDetector,
        profile: &PlatformProfile,
    ) {
        for index in 0..tasks.len() {
            if control.is_cancelled() {
                break;
            }
            self.hold_while_paused(control).await;
            if control.is_cancelled() {
                break;
            }

            self.analyze_task(&mut tasks[index], control).await;
            self.execute_task(
                &mut tasks[index],
                &spec.options,
                control,
                driver,
                detector,
                profile,
            )
            .await;
            self.emit_progress(control).await;

            if !control.is_cancelled() && index + 1 < tasks.len() {
                sleep(spec.options.settle_between_prompts).await;
            }
        }
    }

    async fn run_step_by_step(
        &self,
        spec: &BatchSpec,
        tasks: &mut [Task],
        control: &Arc<BatchControl>,
        driver: &Arc<dyn BrowserDriver>,
        detector: &CompletionDetector,
        profile: &PlatformProfile,
    ) {
        for index in 0..tasks.len() {
            if control.is_cancelled() {
                break;
            }
            self.hold_while_paused(control).await;
            if control.is_cancelled() {
                break;
            }

            let action_type = spec.prompts[index].action_type.clone();
            let report = self.analyze_task(&mut tasks[index], control).await;
            control
                .progress
                .write()
                .touch(format!("awaiting approval for {}", tasks[index].id));

            let decision = self
                .gate_task(spec, &mut tasks[index], &action_type, report.overall)
                .await;
            match decision {
                Ok(resolved) => {
                    if apply_decision(&mut tasks[index], &resolved) {
                        self.execute_task(
                            &mut tasks[index],
                            &spec.options,
                            control,
                            driver,
                            detector,
                            profile,
                        )
                        .await;
                    } else {
                        // Rejection and timeout fail the task without
                        // execution or retries.
                        self.fail_task(
                            &mut tasks[index],
                            control,
                            format!("approval {}", resolved.status.as_str()),
                        )
                        .await;
                    }
                }
                Err(err) => {
                    self.fail_task(&mut tasks[index], control, err.to_string())
                        .await;
                }
            }
            self.emit_progress(control).await;

            if !control.is_cancelled() && index + 1 < tasks.len() {
                sleep(spec.options.settle_between_prompts).await;
            }
        }
    }

    async fn run_windowed(
        &self,
        window_size: usize,
        spec: &BatchSpec,
        tasks: &mut [Task],
        control: &Arc<BatchControl>,
        driver: &Arc<dyn BrowserDriver>,
        detector: &CompletionDetector,
        profile: &PlatformProfile,
    ) {
        let indices: Vec<usize> = (0..tasks.len()).collect();
        let windows: Vec<&[usize]> = indices.chunks(window_size).collect();
        let window_count = windows.len();

        for (nth, window) in windows.into_iter().enumerate() {
            if control.is_cancelled() {
                break;
            }
            self.hold_while_paused(control).await;
            if control.is_cancelled() {
                break;
            }
            debug!(
                target: "scheduler",
                batch_id = %spec.id,
                window = nth,
                size = window.len(),
                "window starting"
            );

            // Approvals for the whole window up front.
            let mut pending: Vec<(usize, ApprovalRequest)> = Vec::new();
            let mut resolved: Vec<(usize, ApprovalRequest)> = Vec::new();
            let mut failed: Vec<(usize, String)> = Vec::new();
            for &index in window {
                let action_type = spec.prompts[index].action_type.clone();
                let report = self.analyze_task(&mut tasks[index], control).await;
                match self
                    .request_task_approval(spec, &mut tasks[index], &action_type, report.overall)
                    .await
                {
                    Ok(record) if record.status == ApprovalStatus::Pending => {
                        pending.push((index, record));
                    }
                    Ok(record) => resolved.push((index, record)),
                    Err(err) => failed.push((index, err.to_string())),
                }
            }

            let waits = pending.into_iter().map(|(index, record)| {
                let timeout = spec.options.approval_timeout;
                async move {
                    (
                        index,
                        self.gate.wait_for_approval(&record.id, timeout).await,
                    )
                }
            });
            for (index, outcome) in join_all(waits).await {
                match outcome {
                    Ok(record) => resolved.push((index, record)),
                    Err(err) => failed.push((index, err.to_string())),
                }
            }

            for (index, message) in failed {
                self.fail_task(&mut tasks[index], control, message).await;
            }

            let mut approved: Vec<usize> = Vec::new();
            for (index, record) in resolved {
                if apply_decision(&mut tasks[index], &record) {
                    approved.push(index);
                } else {
                    self.fail_task(
                        &mut tasks[index],
                        control,
                        format!("approval {}", record.status.as_str()),
                    )
                    .await;
                }
            }
            approved.sort_unstable();

            // Approved prompts execute concurrently; the window joins before
            // the next one starts.
            for &index in &approved {
                tasks[index].status = TaskStatus::Processing;
                self.emit_event(
                    EventKind::TaskStarted,
                    json!({"task_id": tasks[index].id.to_string()}),
                )
                .await;
            }
            let submissions: Vec<(usize, String)> = approved
                .iter()
                .map(|&index| (index, tasks[index].prompt.clone()))
                .collect();
            let executions = submissions.into_iter().map(|(index, prompt)| {
                let options = &spec.options;
                async move {
                    let outcome = self
                        .submit_with_retries(&prompt, options, driver, detector, profile)
                        .await;
                    (index, outcome)
                }
            });
            for (index, (outcome, retries)) in join_all(executions).await {
                match outcome {
                    Ok(result) => {
                        self.complete_task(&mut tasks[index], control, result, retries)
                            .await;
                    }
                    Err(message) => {
                        tasks[index].retry_count = retries;
                        self.fail_task(&mut tasks[index], control, message).await;
                    }
                }
            }
            self.emit_progress(control).await;

            if !control.is_cancelled() && nth + 1 < window_count {
                sleep(spec.options.settle_between_prompts).await;
            }
        }
    }

    /// Request approval for a task and wait for its resolution. Auto-approved
    /// requests return without waiting.
    async fn gate_task(
        &self,
        spec: &BatchSpec,
        task: &mut Task,
        action_type: &str,
        confidence: f64,
    ) -> Result<ApprovalRequest, GateError> {
        let record = self
            .request_task_approval(spec, task, action_type, confidence)
            .await?;
        if record.status == ApprovalStatus::Pending {
            self.gate
                .wait_for_approval(&record.id, spec.options.approval_timeout)
                .await
        } else {
            Ok(record)
        }
    }

    async fn request_task_approval(
        &self,
        spec: &BatchSpec,
        task: &mut Task,
        action_type: &str,
        confidence: f64,
    ) -> Result<ApprovalRequest, GateError> {
        let record = self
            .gate
            .request_approval(ApprovalParams {
                task_id: task.id.clone(),
                agent_id: spec.agent_id.clone(),
                action_type: action_type.to_string(),
                description: describe_prompt(&task.prompt),
                context: json!({
                    "prompt": task.prompt,
                    "target_url": spec.target_url,
                    "batch_id": spec.id.to_string(),
                }),
                confidence,
                threshold: spec.options.approval_threshold,
                screenshot: None,
            })
            .await?;
        task.approval_requests.push(record.id.clone());
        Ok(record)
    }

    async fn analyze_task(&self, task: &mut Task, control: &BatchControl) -> ConfidenceReport {
        task.status = TaskStatus::Analyzing;
        control
            .progress
            .write()
            .touch(format!("analyzing {}", task.id));
        let report = match self.analyzer.analyze(&task.prompt).await {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    target: "scheduler",
                    task_id = %task.id,
                    error = %err,
                    "analysis failed, using conservative defaults"
                );
                ConfidenceReport::conservative_default()
            }
        };
        task.confidence = report.scores.clone();
        task.confidence.insert("overall".to_string(), report.overall);
        report
    }

    async fn execute_task(
        &self,
        task: &mut Task,
        options: &BatchOptions,
        control: &BatchControl,
        driver: &Arc<dyn BrowserDriver>,
        detector: &CompletionDetector,
        profile: &PlatformProfile,
    ) {
        task.status = TaskStatus::Processing;
        control
            .progress
            .write()
            .touch(format!("submitting {}", task.id));
        self.emit_event(
            EventKind::TaskStarted,
            json!({"task_id": task.id.to_string()}),
        )
        .await;

        let (outcome, retries) = self
            .submit_with_retries(&task.prompt, options, driver, detector, profile)
            .await;
        match outcome {
            Ok(result) => self.complete_task(task, control, result, retries).await,
            Err(message) => {
                task.retry_count = retries;
                self.fail_task(task, control, message).await;
            }
        }
    }

    async fn complete_task(
        &self,
        task: &mut Task,
        control: &BatchControl,
        result: Value,
        retries: u32,
    ) {
        debug!(target: "scheduler", task_id = %task.id, retries, "task completed");
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.retry_count = retries;
        task.completed_at = Some(Utc::now());
        control
            .progress
            .write()
            .record_resolution(true, format!("completed {}", task.id));
        self.emit_event(
            EventKind::TaskCompleted,
            json!({"task_id": task.id.to_string(), "retries": retries}),
        )
        .await;
    }

    async fn fail_task(&self, task: &mut Task, control: &BatchControl, error: String) {
        warn!(target: "scheduler", task_id = %task.id, error = %error, "task failed");
        task.status = TaskStatus::Failed;
        task.error = Some(error.clone());
        task.completed_at = Some(Utc::now());
        control
            .progress
            .write()
            .record_resolution(false, format!("failed {}", task.id));
        self.emit_event(
            EventKind::TaskFailed,
            json!({"task_id": task.id.to_string(), "error": error}),
        )
        .await;
    }

    async fn submit_with_retries(
        &self,
        prompt: &str,
        options: &BatchOptions,
        driver: &Arc<dyn BrowserDriver>,
        detector: &CompletionDetector,
        profile: &PlatformProfile,
    ) -> (Result<Value, String>, u32) {
        let mut retries = 0u32;
        loop {
            match self
                .submit_once(prompt, options, driver, detector, profile)
                .await
            {
                Ok(value) => return (Ok(value), retries),
                Err((message, retriable)) => {
                    if !retriable || retries >= options.max_retries {
                        return (Err(message), retries);
                    }
                    retries += 1;
                    debug!(target: "scheduler", retry = retries, error = %message, "retrying after backoff");
                    sleep(options.retry_backoff).await;
                }
            }
        }
    }

    async fn submit_once(
        &self,
        prompt: &str,
        options: &BatchOptions,
        driver: &Arc<dyn BrowserDriver>,
        detector: &CompletionDetector,
        profile: &PlatformProfile,
    ) -> Result<Value, (String, bool)> {
        if let Err(err) = driver.fill(&profile.input_selector, prompt).await {
            return Err((err.to_string(), err.retriable));
        }
        if driver.click(&profile.submit_selector).await.is_err() {
            // Fallback when the submit control cannot be clicked.
            if let Err(err) = driver.press("Enter").await {
                return Err((err.to_string(), err.retriable));
            }
        }

        if !options.wait_for_completion {
            return Ok(json!({"submitted": true}));
        }

        detector
            .wait_for_processing_to_start(detector.config().probe_timeout)
            .await;
        let report = detector
            .wait_for_completion(detector.config().max_wait)
            .await;
        if report.ready {
            Ok(json!({
                "platform": report.platform,
                "strategy": report.strategy.as_str(),
                "elapsed_ms": report.elapsed_ms,
            }))
        } else {
            let message = report
                .error
                .unwrap_or_else(|| "completion wait failed".to_string());
            Err((message, true))
        }
    }

    async fn hold_while_paused(&self, control: &BatchControl) {
        if !control.is_paused() {
            return;
        }
        debug!(target: "scheduler", "run paused at boundary");
        {
            let mut progress = control.progress.write();
            progress.status = BatchStatus::Paused;
            progress.touch("paused");
        }
        while control.is_paused() && !control.is_cancelled() {
            sleep(PAUSE_POLL).await;
        }
        let mut progress = control.progress.write();
        progress.status = BatchStatus::Running;
        progress.touch("resumed");
    }

    async fn emit_progress(&self, control: &BatchControl) {
        let snapshot = control.progress.read().clone();
        self.emit_event(
            EventKind::BatchProgress,
            json!({
                "batch_id": snapshot.batch_id.to_string(),
                "percent": snapshot.percent,
                "completed": snapshot.completed,
                "failed": snapshot.failed,
                "current_action": snapshot.current_action,
            }),
        )
        .await;
    }

    async fn emit_event(&self, kind: EventKind, payload: Value) {
        if let Some(bus) = &self.bus {
            emit(bus.as_ref(), kind, payload).await;
        }
    }
}

fn final_status(tasks: &[Task], cancelled: bool) -> BatchStatus {
    if cancelled {
        return BatchStatus::Cancelled;
    }
    let completed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    let failed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .count();
    if failed == 0 && completed == tasks.len() && !tasks.is_empty() {
        BatchStatus::Completed
    } else if completed > 0 {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    }
}

/// Apply an approval resolution to the task. Human modifications may rewrite
/// the prompt before execution; every modification is recorded as an
/// intervention.
fn apply_decision(task: &mut Task, record: &ApprovalRequest) -> bool {
    if record.status != ApprovalStatus::Approved {
        return false;
    }
    if let Some(response) = &record.response {
        if response.source == ResponseSource::Human {
            if let Some(modifications) = &response.modifications {
                if let Some(new_prompt) = modifications.get("prompt").and_then(|v| v.as_str()) {
                    task.prompt = new_prompt.to_string();
                }
                task.interventions
                    .push(Intervention::new("approval_modification", modifications.clone()));
            }
        }
    }
    true
}

fn describe_prompt(prompt: &str) -> String {
    const MAX: usize = 80;
    let mut text: String = prompt.chars().take(MAX).collect();
    if prompt.chars().count() > MAX {
        text.push_str("...");
    }
    format!("submit prompt: {}", text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_gate::{ApprovalDecision, GatePolicy};
    use browser_adapter::{ScriptedDriver, ScriptedFactory};
    use promptpilot_core_types::{JobId, TaskId};
    use promptpilot_event_bus::InMemoryBus;

    use crate::analyzer::ScriptedAnalyzer;

    fn fast_detector() -> DetectorConfig {
        DetectorConfig {
            max_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            settle_delay: Duration::from_millis(2),
            probe_timeout: Duration::from_millis(10),
        }
    }

    fn fast_options() -> BatchOptions {
        BatchOptions {
            max_retries: 3,
            retry_backoff: Duration::from_millis(5),
            approval_timeout: Some(Duration::from_secs(1)),
            wait_for_completion: true,
            settle_between_prompts: Duration::from_millis(1),
            approval_threshold: None,
        }
    }

    struct Fixture {
        scheduler: Arc<BatchScheduler>,
        driver: Arc<ScriptedDriver>,
        factory: Arc<ScriptedFactory>,
        analyzer: Arc<ScriptedAnalyzer>,
        gate: Arc<ApprovalGate>,
    }

    fn fixture() -> Fixture {
        fixture_with_bus(None)
    }

    fn fixture_with_bus(bus: Option<Arc<dyn EventBus<PilotEvent>>>) -> Fixture {
        let driver = ScriptedDriver::new();
        let factory = ScriptedFactory::new(Arc::clone(&driver));
        let analyzer = ScriptedAnalyzer::new();
        let gate = Arc::new(ApprovalGate::new(GatePolicy::default()));
        let mut scheduler = BatchScheduler::new(
            Arc::clone(&factory) as Arc<dyn DriverFactory>,
            Arc::clone(&gate),
            Arc::clone(&analyzer) as Arc<dyn ConfidenceAnalyzer>,
        )
        .with_detector_config(fast_detector());
        if let Some(bus) = bus {
            scheduler = scheduler.with_bus(bus);
        }
        Fixture {
            scheduler: Arc::new(scheduler),
            driver,
            factory,
            analyzer,
            gate,
        }
    }

    fn spec_with(prompts: usize, mode: ExecutionMode) -> (BatchSpec, Vec<Task>) {
        let spec = BatchSpec::new("test-batch", "https://unknown.example.com")
            .with_prompts((0..prompts).map(|i| format!("prompt {}", i)))
            .with_mode(mode)
            .with_options(fast_options());
        let job = JobId::new();
        let tasks = spec
            .prompts
            .iter()
            .enumerate()
            .map(|(i, p)| Task::new(TaskId::derived(&job, i), p.text.clone(), "generic"))
            .collect();
        (spec, tasks)
    }

    #[tokio::test]
    async fn sequential_completes_all_prompts_with_one_session() {
        let f = fixture();
        let (spec, tasks) = spec_with(3, ExecutionMode::Sequential);
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.completed_count(), 3);
        assert_eq!(f.driver.init_count(), 1);
        assert_eq!(f.driver.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let f = fixture();
        f.driver.fail_next_fills(2);
        let (spec, tasks) = spec_with(1, ExecutionMode::Sequential);
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.tasks[0].status, TaskStatus::Completed);
        assert_eq!(report.tasks[0].retry_count, 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_only_that_prompt() {
        let f = fixture();
        // First prompt burns all four attempts; second succeeds.
        f.driver.fail_next_fills(4);
        let (spec, tasks) = spec_with(2, ExecutionMode::Sequential);
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::PartialSuccess);
        assert_eq!(report.tasks[0].status, TaskStatus::Failed);
        assert_eq!(report.tasks[0].retry_count, 3);
        assert_eq!(report.tasks[1].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn session_acquisition_failure_fails_every_task() {
        let f = fixture();
        f.factory.fail_create(true);
        let (spec, tasks) = spec_with(2, ExecutionMode::Sequential);
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(report
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Failed && t.error.is_some()));
        assert_eq!(f.driver.cleanup_count(), 0);
    }

    #[tokio::test]
    async fn initialize_failure_still_tears_the_session_down() {
        let f = fixture();
        f.driver.fail_initialize(true);
        let (spec, tasks) = spec_with(2, ExecutionMode::Sequential);
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Failed));
        assert_eq!(f.driver.init_count(), 0);
        assert_eq!(f.driver.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn detected_platform_is_written_back_to_tasks() {
        let f = fixture();
        let (spec, mut tasks) = spec_with(2, ExecutionMode::Sequential);
        for task in &mut tasks {
            task.target_platform = "auto".to_string();
        }
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report
            .tasks
            .iter()
            .all(|t| t.target_platform == "generic"));
    }

    #[tokio::test]
    async fn windowed_mode_walks_fixed_windows() {
        let f = fixture();
        let (spec, tasks) =
            spec_with(7, ExecutionMode::WindowedParallel { window_size: 3 });
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.completed_count(), 7);
        let fills = f
            .driver
            .calls()
            .iter()
            .filter(|c| c.starts_with("fill:"))
            .count();
        assert_eq!(fills, 7);
        // High-confidence execute_task approvals resolve without a human.
        assert_eq!(f.gate.stats().auto_approved, 7);
    }

    #[tokio::test]
    async fn windows_join_before_the_next_starts() {
        let f = fixture();
        f.driver.set_op_delay(Duration::from_millis(20));
        let (spec, tasks) =
            spec_with(7, ExecutionMode::WindowedParallel { window_size: 3 });
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);

        // Prompts are "prompt {i}"; the fill call retains the index. Window
        // membership (i / 3) must be non-decreasing across the recorded
        // fills: 3, then 3, then the final window of 1.
        let windows: Vec<usize> = f
            .driver
            .calls()
            .iter()
            .filter(|c| c.starts_with("fill:"))
            .map(|c| {
                let index: usize = c.rsplit(' ').next().unwrap().parse().unwrap();
                index / 3
            })
            .collect();
        assert_eq!(windows.len(), 7);
        let mut drained = windows.clone();
        drained.sort_unstable();
        assert_eq!(
            windows, drained,
            "a window started before the previous one drained"
        );
        assert_eq!(windows.iter().filter(|w| **w == 0).count(), 3);
        assert_eq!(windows.iter().filter(|w| **w == 1).count(), 3);
        assert_eq!(windows.iter().filter(|w| **w == 2).count(), 1);
    }

    #[tokio::test]
    async fn step_by_step_rejection_skips_execution() {
        let f = fixture();
        f.analyzer.set_default(ConfidenceReport::conservative_default());
        let (spec, tasks) = spec_with(1, ExecutionMode::StepByStep);
        let handle = f.scheduler.start(spec, tasks);

        let record = loop {
            let pending = f.gate.pending();
            if let Some(record) = pending.first() {
                break record.clone();
            }
            sleep(Duration::from_millis(5)).await;
        };
        f.gate
            .respond_to_approval(&record.id, ApprovalDecision::Reject, None, None)
            .await
            .unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(report.tasks[0].status, TaskStatus::Failed);
        assert_eq!(report.tasks[0].retry_count, 0);
        assert!(f.driver.calls().iter().all(|c| !c.starts_with("fill:")));
    }

    #[tokio::test]
    async fn approval_timeout_fails_task_without_execution() {
        let f = fixture();
        f.analyzer.set_default(ConfidenceReport::conservative_default());
        let (mut spec, tasks) = spec_with(1, ExecutionMode::StepByStep);
        spec.options.approval_timeout = Some(Duration::from_millis(30));
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        assert_eq!(report.tasks[0].status, TaskStatus::Failed);
        assert!(report.tasks[0].error.as_deref().unwrap().contains("timeout"));
        assert!(f.driver.calls().iter().all(|c| !c.starts_with("fill:")));
    }

    #[tokio::test]
    async fn human_modification_rewrites_the_prompt() {
        let f = fixture();
        f.analyzer.set_default(ConfidenceReport::conservative_default());
        let (spec, tasks) = spec_with(1, ExecutionMode::StepByStep);
        let handle = f.scheduler.start(spec, tasks);

        let record = loop {
            let pending = f.gate.pending();
            if let Some(record) = pending.first() {
                break record.clone();
            }
            sleep(Duration::from_millis(5)).await;
        };
        f.gate
            .respond_to_approval(
                &record.id,
                ApprovalDecision::Approve,
                Some("rephrase".to_string()),
                Some(json!({"prompt": "rewritten prompt"})),
            )
            .await
            .unwrap();

        let report = handle.await.unwrap().unwrap();
        let task = &report.tasks[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.prompt, "rewritten prompt");
        assert_eq!(task.interventions.len(), 1);
        assert!(f
            .driver
            .calls()
            .iter()
            .any(|c| c.contains("rewritten prompt")));
    }

    #[tokio::test]
    async fn analysis_failure_degrades_to_conservative_defaults() {
        let f = fixture();
        f.analyzer.fail(true);
        let (spec, tasks) = spec_with(1, ExecutionMode::Sequential);
        let report = f.scheduler.run_batch(spec, tasks).await.unwrap();
        let task = &report.tasks[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert!((task.confidence["overall"] - 0.4).abs() < 1e-9);
        assert!((task.confidence["oversight_needed"] - 0.8).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_leaves_remaining_tasks_pending() {
        let f = fixture();
        f.driver.set_op_delay(Duration::from_millis(40));
        let (spec, tasks) = spec_with(5, ExecutionMode::Sequential);
        let batch_id = spec.id.clone();
        let handle = f.scheduler.start(spec, tasks);

        sleep(Duration::from_millis(100)).await;
        f.scheduler.cancel(&batch_id).unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Cancelled);
        assert!(report
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Pending));
        // The in-flight prompt is never interrupted mid-submission.
        assert!(report.tasks.iter().all(|t| !matches!(
            t.status,
            TaskStatus::Processing | TaskStatus::Analyzing
        )));
        assert_eq!(f.driver.cleanup_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_holds_at_boundary_and_resume_finishes() {
        let f = fixture();
        f.driver.set_op_delay(Duration::from_millis(30));
        let (spec, tasks) = spec_with(4, ExecutionMode::Sequential);
        let batch_id = spec.id.clone();
        let handle = f.scheduler.start(spec, tasks);

        sleep(Duration::from_millis(40)).await;
        f.scheduler.pause(&batch_id).unwrap();
        sleep(Duration::from_millis(100)).await;
        let progress = f.scheduler.progress(&batch_id).unwrap();
        assert_eq!(progress.status, BatchStatus::Paused);
        let resolved_at_pause = progress.completed + progress.failed;
        assert!(resolved_at_pause < 4);

        f.scheduler.resume(&batch_id).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.completed_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_batch_id_is_rejected_while_running() {
        let f = fixture();
        f.driver.set_op_delay(Duration::from_millis(40));
        let (spec, tasks) = spec_with(3, ExecutionMode::Sequential);
        let batch_id = spec.id.clone();
        let (mut dup_spec, dup_tasks) = spec_with(3, ExecutionMode::Sequential);
        dup_spec.id = batch_id.clone();

        let handle = f.scheduler.start(spec, tasks);
        sleep(Duration::from_millis(20)).await;
        let err = f.scheduler.run_batch(dup_spec, dup_tasks).await.unwrap_err();
        assert!(matches!(err, ScheduleError::AlreadyRunning(_)));

        f.scheduler.cancel(&batch_id).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_tears_the_session_down_once() {
        let f = fixture();
        f.driver.set_op_delay(Duration::from_millis(40));
        let (spec, tasks) = spec_with(5, ExecutionMode::Sequential);
        let batch_id = spec.id.clone();
        let handle = f.scheduler.start(spec, tasks);

        sleep(Duration::from_millis(60)).await;
        f.scheduler.stop(&batch_id).await.unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(f.driver.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn lifecycle_events_reach_the_bus() {
        let bus = InMemoryBus::<PilotEvent>::new(64);
        let mut rx = bus.subscribe();
        let f = fixture_with_bus(Some(bus as Arc<dyn EventBus<PilotEvent>>));
        let (spec, tasks) = spec_with(1, ExecutionMode::Sequential);
        f.scheduler.run_batch(spec, tasks).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::BatchStarted));
        assert!(kinds.contains(&EventKind::TaskStarted));
        assert!(kinds.contains(&EventKind::TaskCompleted));
        assert!(kinds.contains(&EventKind::BatchCompleted));
    }

    #[tokio::test]
    async fn task_count_mismatch_is_rejected_up_front() {
        let f = fixture();
        let (spec, mut tasks) = spec_with(3, ExecutionMode::Sequential);
        tasks.pop();
        let err = f.scheduler.run_batch(spec, tasks).await.unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidState(_)));
    }
}
