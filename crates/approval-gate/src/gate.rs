use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use promptpilot_core_types::{ApprovalId, TaskId};
use promptpilot_event_bus::{emit, EventBus, EventKind, PilotEvent};

use crate::errors::GateError;
use crate::policy::GatePolicy;
use crate::types::{
    ApprovalDecision, ApprovalParams, ApprovalRequest, ApprovalResponse, ApprovalStatus,
    ResponseSource,
};

/// A pending request plus the channel its waiters observe. The request is
/// claimed by moving it out of `Pending` under its own lock; whoever makes
/// that transition (responder or timed-out waiter) archives the record
/// before the entry leaves the pending map, so lookups never fall between
/// the two.
struct PendingEntry {
    request: Mutex<ApprovalRequest>,
    resolved_tx: watch::Sender<bool>,
}

/// Aggregate counters over everything the gate has seen.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GateStats {
    pub total_requests: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub auto_approved: usize,
    /// approved / resolved, 0.0 when nothing has resolved.
    pub approval_rate: f64,
    /// auto-approved / total.
    pub auto_approval_rate: f64,
    /// timed out / resolved.
    pub timeout_rate: f64,
    /// Mean seconds from creation to resolution, human responses only.
    pub avg_response_secs: f64,
}

/// Human-in-the-loop checkpoint with policy-driven auto-approval.
pub struct ApprovalGate {
    policy: RwLock<GatePolicy>,
    pending: DashMap<ApprovalId, Arc<PendingEntry>>,
    /// At most one pending request per task.
    task_index: DashMap<TaskId, ApprovalId>,
    history: Mutex<Vec<ApprovalRequest>>,
    bus: Option<Arc<dyn EventBus<PilotEvent>>>,
}

impl ApprovalGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            pending: DashMap::new(),
            task_index: DashMap::new(),
            history: Mutex::new(Vec::new()),
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus<PilotEvent>>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy.read().clone()
    }

    /// Swap the policy at runtime. Applies to future requests; already
    /// pending ones keep waiting under the decision made at submission.
    pub fn update_policy(&self, policy: GatePolicy) {
        info!(
            target: "approval_gate",
            threshold = policy.auto_approve_threshold,
            enabled = policy.enabled,
            "policy updated"
        );
        *self.policy.write() = policy;
    }

    /// Submit an action for approval. Auto-approved requests go straight to
    /// history; anything else becomes pending until responded or timed out.
    pub async fn request_approval(
        &self,
        params: ApprovalParams,
    ) -> Result<ApprovalRequest, GateError> {
        if let Some(existing) = self.task_index.get(&params.task_id) {
            if let Some(entry) = self.pending.get(existing.value()) {
                if entry.value().request.lock().status == ApprovalStatus::Pending {
                    return Err(GateError::AlreadyPending(params.task_id.clone()));
                }
            }
        }

        let threshold = params.threshold;
        let mut request = ApprovalRequest::new(params);

        let auto = self.policy.read().should_auto_approve(
            &request.action_type,
            request.confidence,
            threshold,
        );
        if auto {
            request.resolve(
                ApprovalStatus::Approved,
                ApprovalResponse {
                    source: ResponseSource::Auto,
                    reasoning: format!(
                        "confidence {:.2} cleared auto-approval policy",
                        request.confidence
                    ),
                    modifications: None,
                },
            );
            info!(
                target: "approval_gate",
                approval_id = %request.id,
                task_id = %request.task_id,
                action = %request.action_type,
                confidence = request.confidence,
                "auto-approved"
            );
            self.archive(request.clone());
            self.emit_event(
                EventKind::AutoApproved,
                json!({
                    "approval_id": request.id.to_string(),
                    "task_id": request.task_id.to_string(),
                    "action_type": request.action_type,
                    "confidence": request.confidence,
                }),
            )
            .await;
            return Ok(request);
        }

        let (resolved_tx, _) = watch::channel(false);
        let entry = Arc::new(PendingEntry {
            request: Mutex::new(request.clone()),
            resolved_tx,
        });
        self.pending.insert(request.id.clone(), entry);
        self.task_index
            .insert(request.task_id.clone(), request.id.clone());

        info!(
            target: "approval_gate",
            approval_id = %request.id,
            task_id = %request.task_id,
            action = %request.action_type,
            confidence = request.confidence,
            "approval requested, waiting for response"
        );
        self.emit_event(
            EventKind::ApprovalRequested,
            json!({
                "approval_id": request.id.to_string(),
                "task_id": request.task_id.to_string(),
                "action_type": request.action_type,
                "description": request.description,
                "confidence": request.confidence,
            }),
        )
        .await;

        Ok(request)
    }

    /// Block until the request resolves, up to `timeout` (policy default when
    /// `None`). A timeout resolves the request to `Timeout` and returns the
    /// record rather than erroring. Waiting on an already-resolved request
    /// returns its history record immediately.
    pub async fn wait_for_approval(
        &self,
        id: &ApprovalId,
        timeout: Option<Duration>,
    ) -> Result<ApprovalRequest, GateError> {
        let timeout = timeout.unwrap_or_else(|| self.policy.read().default_timeout);
        let deadline = Instant::now() + timeout;

        let entry = match self.pending.get(id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return self.lookup_history(id),
        };

        let mut rx = entry.resolved_tx.subscribe();
        loop {
            if *rx.borrow() {
                return self.lookup_history(id);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped: entry was claimed, resolution is in history.
                Ok(Err(_)) => return self.lookup_history(id),
                Err(_) => return self.resolve_timeout(id, &entry).await,
            }
        }
    }

    /// Resolve a pending request with a human decision. The first resolver
    /// wins; responding to an already-resolved request is `NotFound`.
    pub async fn respond_to_approval(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
        reasoning: Option<String>,
        modifications: Option<serde_json::Value>,
    ) -> Result<ApprovalRequest, GateError> {
        let entry = self
            .pending
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GateError::NotFound(id.clone()))?;

        let record = {
            let mut request = entry.request.lock();
            if request.status != ApprovalStatus::Pending {
                // Another resolver claimed it first.
                return Err(GateError::NotFound(id.clone()));
            }
            request.resolve(
                decision.status(),
                ApprovalResponse {
                    source: ResponseSource::Human,
                    reasoning: reasoning.unwrap_or_default(),
                    modifications,
                },
            );
            let record = request.clone();
            // Archive while still holding the claim, so any lookup that
            // misses the pending entry finds the record in history.
            self.archive(record.clone());
            record
        };
        self.pending.remove(id);
        self.task_index.remove(&record.task_id);
        // Wake waiters after the history record exists.
        let _ = entry.resolved_tx.send(true);

        info!(
            target: "approval_gate",
            approval_id = %record.id,
            task_id = %record.task_id,
            status = record.status.as_str(),
            "approval resolved by human"
        );
        self.emit_event(
            EventKind::ApprovalResolved,
            json!({
                "approval_id": record.id.to_string(),
                "task_id": record.task_id.to_string(),
                "status": record.status.as_str(),
            }),
        )
        .await;

        Ok(record)
    }

    async fn resolve_timeout(
        &self,
        id: &ApprovalId,
        entry: &Arc<PendingEntry>,
    ) -> Result<ApprovalRequest, GateError> {
        let record = {
            let mut request = entry.request.lock();
            if request.status != ApprovalStatus::Pending {
                // Lost the race to a responder: its resolution is archived.
                return self.lookup_history(id);
            }
            request.resolve(
                ApprovalStatus::Timeout,
                ApprovalResponse {
                    source: ResponseSource::Timeout,
                    reasoning: "no response before deadline".to_string(),
                    modifications: None,
                },
            );
            let record = request.clone();
            self.archive(record.clone());
            record
        };
        self.pending.remove(id);
        self.task_index.remove(&record.task_id);
        let _ = entry.resolved_tx.send(true);

        warn!(
            target: "approval_gate",
            approval_id = %record.id,
            task_id = %record.task_id,
            "approval request timed out"
        );
        self.emit_event(
            EventKind::ApprovalTimeout,
            json!({
                "approval_id": record.id.to_string(),
                "task_id": record.task_id.to_string(),
            }),
        )
        .await;

        Ok(record)
    }

    /// Snapshot of currently pending requests, oldest first. Entries already
    /// claimed but not yet swept from the map are excluded.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut out: Vec<ApprovalRequest> = self
            .pending
            .iter()
            .map(|entry| entry.value().request.lock().clone())
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Most recent resolved requests, newest first.
    pub fn history(&self, limit: usize) -> Vec<ApprovalRequest> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> GateStats {
        // Count pending before locking history; resolvers hold the entry
        // lock while archiving, so the locks must nest in that order.
        let pending = self.pending().len();
        let history = self.history.lock();
        let mut stats = GateStats {
            pending,
            total_requests: pending + history.len(),
            ..GateStats::default()
        };

        let mut human_latency_sum = 0.0;
        let mut human_latency_count = 0usize;
        for record in history.iter() {
            match record.status {
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Rejected => stats.rejected += 1,
                ApprovalStatus::Timeout => stats.timed_out += 1,
                ApprovalStatus::Pending => {}
            }
            if record.auto_approved() {
                stats.auto_approved += 1;
            } else if let Some(responded_at) = record.responded_at {
                human_latency_sum +=
                    (responded_at - record.created_at).num_milliseconds() as f64 / 1000.0;
                human_latency_count += 1;
            }
        }

        let resolved = stats.approved + stats.rejected + stats.timed_out;
        if resolved > 0 {
            stats.approval_rate = stats.approved as f64 / resolved as f64;
            stats.timeout_rate = stats.timed_out as f64 / resolved as f64;
        }
        if stats.total_requests > 0 {
            stats.auto_approval_rate = stats.auto_approved as f64 / stats.total_requests as f64;
        }
        if human_latency_count > 0 {
            stats.avg_response_secs = human_latency_sum / human_latency_count as f64;
        }
        stats
    }

    fn lookup_history(&self, id: &ApprovalId) -> Result<ApprovalRequest, GateError> {
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| GateError::NotFound(id.clone()))
    }

    fn archive(&self, record: ApprovalRequest) {
        debug!(
            target: "approval_gate",
            approval_id = %record.id,
            status = record.status.as_str(),
            "archiving approval record"
        );
        self.history.lock().push(record);
    }

    async fn emit_event(&self, kind: EventKind, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            emit(bus.as_ref(), kind, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptpilot_core_types::JobId;

    fn params(action: &str, confidence: f64) -> ApprovalParams {
        let job = JobId::new();
        ApprovalParams {
            task_id: TaskId::derived(&job, 0),
            agent_id: "agent-1".to_string(),
            action_type: action.to_string(),
            description: format!("{action} on example.com"),
            context: json!({"url": "https://example.com"}),
            confidence,
            threshold: None,
            screenshot: None,
        }
    }

    fn gate() -> ApprovalGate {
        ApprovalGate::new(GatePolicy::default())
    }

    #[tokio::test]
    async fn high_confidence_auto_approves() {
        let gate = gate();
        let record = gate.request_approval(params("execute_task", 0.9)).await.unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert!(record.auto_approved());
        assert!(gate.pending().is_empty());
        assert_eq!(gate.history(10).len(), 1);
    }

    #[tokio::test]
    async fn never_approve_action_stays_pending_at_any_confidence() {
        let gate = gate();
        let record = gate.request_approval(params("delete", 0.99)).await.unwrap();
        assert_eq!(record.status, ApprovalStatus::Pending);
        assert_eq!(gate.pending().len(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_and_archives_timeout_record() {
        let gate = gate();
        let record = gate.request_approval(params("delete", 0.5)).await.unwrap();
        let resolved = gate
            .wait_for_approval(&record.id, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Timeout);
        assert!(gate.pending().is_empty());
        assert_eq!(gate.history(10)[0].status, ApprovalStatus::Timeout);
    }

    #[tokio::test]
    async fn respond_resolves_concurrent_waiter() {
        let gate = Arc::new(gate());
        let record = gate.request_approval(params("delete", 0.5)).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let id = record.id.clone();
            tokio::spawn(async move {
                gate.wait_for_approval(&id, Some(Duration::from_secs(5))).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resolved = gate
            .respond_to_approval(
                &record.id,
                ApprovalDecision::Approve,
                Some("looks safe".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);

        let waited = waiter.await.unwrap().unwrap();
        assert_eq!(waited.status, ApprovalStatus::Approved);
        assert_eq!(
            waited.response.as_ref().unwrap().source,
            ResponseSource::Human
        );
    }

    #[tokio::test]
    async fn repeated_waits_return_the_same_resolution() {
        let gate = gate();
        let record = gate.request_approval(params("delete", 0.5)).await.unwrap();
        gate.respond_to_approval(&record.id, ApprovalDecision::Reject, None, None)
            .await
            .unwrap();

        let first = gate.wait_for_approval(&record.id, None).await.unwrap();
        let second = gate.wait_for_approval(&record.id, None).await.unwrap();
        assert_eq!(first.status, ApprovalStatus::Rejected);
        assert_eq!(second.status, ApprovalStatus::Rejected);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_waiter_sees_the_archived_resolution() {
        let gate = Arc::new(gate());
        let record = gate.request_approval(params("delete", 0.5)).await.unwrap();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let id = record.id.clone();
                tokio::spawn(async move {
                    gate.wait_for_approval(&id, Some(Duration::from_secs(5))).await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.respond_to_approval(&record.id, ApprovalDecision::Approve, None, None)
            .await
            .unwrap();

        for waiter in waiters {
            let seen = waiter.await.unwrap().unwrap();
            assert_eq!(seen.status, ApprovalStatus::Approved);
            assert_eq!(seen.id, record.id);
        }
        // A wait arriving after resolution reads the same archived record.
        let late = gate
            .wait_for_approval(&record.id, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(late.status, ApprovalStatus::Approved);
        assert_eq!(gate.history(10).len(), 1);
    }

    #[tokio::test]
    async fn responding_twice_is_not_found() {
        let gate = gate();
        let record = gate.request_approval(params("delete", 0.5)).await.unwrap();
        gate.respond_to_approval(&record.id, ApprovalDecision::Approve, None, None)
            .await
            .unwrap();
        let err = gate
            .respond_to_approval(&record.id, ApprovalDecision::Approve, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotFound(_)));
    }

    #[tokio::test]
    async fn one_pending_request_per_task() {
        let gate = gate();
        let p = params("delete", 0.5);
        gate.request_approval(p.clone()).await.unwrap();
        let err = gate.request_approval(p).await.unwrap_err();
        assert!(matches!(err, GateError::AlreadyPending(_)));
    }

    #[tokio::test]
    async fn per_request_threshold_override_loosens_policy() {
        let gate = gate();
        let mut p = params("execute_task", 0.75);
        p.threshold = Some(0.7);
        let record = gate.request_approval(p).await.unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn policy_update_applies_to_new_requests() {
        let gate = gate();
        let first = gate
            .request_approval(params("execute_task", 0.75))
            .await
            .unwrap();
        assert_eq!(first.status, ApprovalStatus::Pending);

        gate.update_policy(GatePolicy {
            auto_approve_threshold: 0.7,
            ..GatePolicy::default()
        });
        let second = gate
            .request_approval(params("execute_task", 0.75))
            .await
            .unwrap();
        assert_eq!(second.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn stats_cover_all_resolutions() {
        let gate = gate();
        gate.request_approval(params("execute_task", 0.95)).await.unwrap();
        let pending = gate.request_approval(params("delete", 0.5)).await.unwrap();
        gate.respond_to_approval(&pending.id, ApprovalDecision::Reject, None, None)
            .await
            .unwrap();
        let timed = gate.request_approval(params("purchase", 0.5)).await.unwrap();
        gate.wait_for_approval(&timed.id, Some(Duration::from_millis(20)))
            .await
            .unwrap();

        let stats = gate.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.auto_approved, 1);
        assert!((stats.approval_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
