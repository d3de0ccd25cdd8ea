//! End-to-end job runs against scripted collaborators: a human reviewer in
//! the loop, lifecycle events on the bus, and terminal-status invariants.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use approval_gate::{ApprovalGate, GatePolicy};
use batch_scheduler::BatchOptions;
use browser_adapter::{DriverFactory, ScriptedDriver, ScriptedFactory};
use completion_detector::DetectorConfig;
use job_orchestrator::{JobSpec, MockTextGen, Orchestrator, TextGenerationClient};
use promptpilot_core_types::JobStatus;
use promptpilot_event_bus::{EventBus, EventKind, InMemoryBus, PilotEvent};

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
        approval_timeout: Some(Duration::from_secs(2)),
        wait_for_completion: true,
        settle_between_prompts: Duration::from_millis(1),
        approval_threshold: None,
    }
}

fn orchestrator_with(
    driver: &Arc<ScriptedDriver>,
    bus: Option<Arc<dyn EventBus<PilotEvent>>>,
) -> Arc<Orchestrator> {
    let factory = ScriptedFactory::new(Arc::clone(driver));
    let textgen = MockTextGen::new();
    let gate = Arc::new(ApprovalGate::new(GatePolicy::default()));
    let mut orchestrator = Orchestrator::with_detector_config(
        factory as Arc<dyn DriverFactory>,
        textgen as Arc<dyn TextGenerationClient>,
        gate,
        fast_detector(),
    );
    if let Some(bus) = bus {
        orchestrator = orchestrator.with_bus(bus);
    }
    Arc::new(orchestrator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn human_reviewer_approves_a_step_by_step_job() {
    let driver = ScriptedDriver::new();
    let orchestrator = orchestrator_with(&driver, None);

    // High threshold forces every prompt through a human.
    let spec = JobSpec::new("reviewed run", "https://unknown.example.com")
        .with_prompts(["first prompt", "second prompt"])
        .with_step_by_step(true)
        .with_approval_threshold(0.99)
        .with_options(fast_options());
    let job = orchestrator.create_job(spec).await.unwrap();

    let reviewer = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let mut approved = 0;
            while approved < 2 {
                for request in orchestrator.pending_approvals() {
                    orchestrator
                        .respond_to_approval(
                            &request.id,
                            "approve",
                            Some("reviewed".to_string()),
                            None,
                        )
                        .await
                        .unwrap();
                    approved += 1;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let report = orchestrator.run_job(&job.id).await.unwrap();
    reviewer.await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.completed, 2);
    assert_eq!(report.approval_requests, 2);
    assert_eq!(orchestrator.gate().stats().approved, 2);
    assert_eq!(driver.cleanup_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reviewer_modification_is_recorded_as_intervention() {
    let driver = ScriptedDriver::new();
    let orchestrator = orchestrator_with(&driver, None);

    let spec = JobSpec::new("edited run", "https://unknown.example.com")
        .with_prompts(["original prompt"])
        .with_step_by_step(true)
        .with_approval_threshold(0.99)
        .with_options(fast_options());
    let job = orchestrator.create_job(spec).await.unwrap();

    let reviewer = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            loop {
                if let Some(request) = orchestrator.pending_approvals().first() {
                    orchestrator
                        .respond_to_approval(
                            &request.id,
                            "approve",
                            None,
                            Some(json!({"prompt": "edited prompt"})),
                        )
                        .await
                        .unwrap();
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let report = orchestrator.run_job(&job.id).await.unwrap();
    reviewer.await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.human_interventions, 1);
    assert!(driver
        .calls()
        .iter()
        .any(|call| call.contains("edited prompt")));
}

#[tokio::test]
async fn job_lifecycle_events_flow_on_the_bus() {
    let bus = InMemoryBus::<PilotEvent>::new(128);
    let mut rx = bus.subscribe();
    let driver = ScriptedDriver::new();
    let orchestrator = orchestrator_with(&driver, Some(bus as Arc<dyn EventBus<PilotEvent>>));

    let spec = JobSpec::new("event run", "https://unknown.example.com")
        .with_prompts(["only prompt"])
        .with_options(fast_options());
    let job = orchestrator.create_job(spec).await.unwrap();
    orchestrator.run_job(&job.id).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    for expected in [
        EventKind::JobCreated,
        EventKind::JobStarted,
        EventKind::BatchStarted,
        EventKind::TaskStarted,
        EventKind::TaskCompleted,
        EventKind::BatchCompleted,
        EventKind::JobCompleted,
    ] {
        assert!(kinds.contains(&expected), "missing {:?}", expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_a_running_job_finalizes_it_as_stopped() {
    let driver = ScriptedDriver::new();
    driver.set_op_delay(Duration::from_millis(40));
    let orchestrator = orchestrator_with(&driver, None);

    let spec = JobSpec::new("long run", "https://unknown.example.com")
        .with_prompts((0..5).map(|i| format!("prompt {}", i)))
        .with_options(fast_options());
    let job = orchestrator.create_job(spec).await.unwrap();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let id = job.id.clone();
        tokio::spawn(async move { orchestrator.run_job(&id).await })
    };

    sleep(Duration::from_millis(80)).await;
    orchestrator.stop_job(&job.id).await.unwrap();
    let report = runner.await.unwrap().unwrap();

    assert_eq!(report.status, JobStatus::Stopped);
    assert!(report.completed + report.failed < report.total);
    assert_eq!(driver.cleanup_count(), 1);

    let view = orchestrator.get_status(&job.id).unwrap();
    assert_eq!(view.status, JobStatus::Stopped);
}
