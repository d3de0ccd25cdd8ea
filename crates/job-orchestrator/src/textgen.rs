use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Result of one text generation call. Failures are data, not errors: the
/// orchestration layers degrade rather than abort when the backend is down.
#[derive(Clone, Debug)]
pub struct GenerationOutcome {
    pub success: bool,
    pub text: String,
    pub error: Option<String>,
}

impl GenerationOutcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            text: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Text generation backend used for confidence analysis.
#[async_trait]
pub trait TextGenerationClient: Send + Sync {
    async fn process(&self, prompt: &str, context: &Value) -> GenerationOutcome;
    async fn health_check(&self) -> bool;
}

/// Canned-response client for tests and offline development. Replies with a
/// fixed analysis payload, or a scripted failure.
pub struct MockTextGen {
    healthy: AtomicBool,
    fail: AtomicBool,
    reply: Mutex<String>,
}

impl MockTextGen {
    /// Defaults to a high-confidence analysis so auto-approval paths flow
    /// without setup.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            reply: Mutex::new(
                r#"{"complexity":0.1,"risk":0.1,"success_probability":0.95,"oversight_needed":0.1}"#
                    .to_string(),
            ),
        })
    }

    pub fn set_reply(&self, reply: impl Into<String>) {
        *self.reply.lock() = reply.into();
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl TextGenerationClient for MockTextGen {
    async fn process(&self, _prompt: &str, _context: &Value) -> GenerationOutcome {
        if self.fail.load(Ordering::SeqCst) {
            GenerationOutcome::failed("scripted generation failure")
        } else {
            GenerationOutcome::ok(self.reply.lock().clone())
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
