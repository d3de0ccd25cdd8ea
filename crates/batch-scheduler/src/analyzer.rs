use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use promptpilot_core_types::ConfidenceReport;

#[derive(Debug, Error, Clone)]
#[error("confidence analysis failed: {0}")]
pub struct AnalyzeError(pub String);

/// Pre-execution confidence analysis of a prompt. The scheduler degrades to
/// [`ConfidenceReport::conservative_default`] when an implementation fails,
/// so a broken analysis backend routes tasks to review instead of aborting
/// them.
#[async_trait]
pub trait ConfidenceAnalyzer: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<ConfidenceReport, AnalyzeError>;
}

/// Fixed-score analyzer for tests: a default report, optional per-prompt
/// overrides and a failure switch.
pub struct ScriptedAnalyzer {
    default: Mutex<ConfidenceReport>,
    overrides: Mutex<HashMap<String, ConfidenceReport>>,
    fail: AtomicBool,
}

impl ScriptedAnalyzer {
    /// High-confidence by default so auto-approval paths flow without setup.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            default: Mutex::new(ConfidenceReport::weighted(0.1, 0.1, 0.95, 0.1)),
            overrides: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_default(&self, report: ConfidenceReport) {
        *self.default.lock() = report;
    }

    pub fn set_for(&self, prompt: impl Into<String>, report: ConfidenceReport) {
        self.overrides.lock().insert(prompt.into(), report);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfidenceAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, prompt: &str) -> Result<ConfidenceReport, AnalyzeError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AnalyzeError("scripted analyzer failure".to_string()));
        }
        if let Some(report) = self.overrides.lock().get(prompt) {
            return Ok(report.clone());
        }
        Ok(self.default.lock().clone())
    }
}
