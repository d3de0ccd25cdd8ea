use serde::{Deserialize, Serialize};

use crate::signatures::PlatformSignature;

/// Which polling discipline decides that a platform has finished generating.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// No processing indicator visible and the submit control visible and
    /// enabled again.
    ButtonStateChange,
    /// All processing indicators gone, then a fixed settle delay.
    StopButtonDisappears,
    /// A completion indicator appeared, then network idle.
    GenerationComplete,
    /// Network idle, then a fixed settle delay. Generic fallback.
    NetworkIdle,
}

impl WaitStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitStrategy::ButtonStateChange => "button_state_change",
            WaitStrategy::StopButtonDisappears => "stop_button_disappears",
            WaitStrategy::GenerationComplete => "generation_complete",
            WaitStrategy::NetworkIdle => "network_idle",
        }
    }
}

/// Cached descriptor of a target's input, submission and completion signals.
/// Computed once per navigation target and reused for the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub platform: String,
    pub input_selector: String,
    pub submit_selector: String,
    pub processing_indicators: Vec<String>,
    pub completion_indicators: Vec<String>,
    pub wait_strategy: WaitStrategy,
}

impl PlatformProfile {
    pub fn from_signature(signature: &PlatformSignature) -> Self {
        Self {
            platform: signature.platform.to_string(),
            input_selector: signature.input_selector.to_string(),
            submit_selector: signature.submit_selector.to_string(),
            processing_indicators: signature
                .processing_indicators
                .iter()
                .map(|s| s.to_string())
                .collect(),
            completion_indicators: signature
                .completion_indicators
                .iter()
                .map(|s| s.to_string())
                .collect(),
            wait_strategy: signature.wait_strategy,
        }
    }

    /// Fallback profile for targets no signature recognises: broad selectors
    /// and a network-idle wait.
    pub fn generic() -> Self {
        Self {
            platform: "generic".to_string(),
            input_selector: "textarea, input[type=\"text\"], [contenteditable=\"true\"]"
                .to_string(),
            submit_selector: "button[type=\"submit\"]".to_string(),
            processing_indicators: vec![
                ".loading".to_string(),
                ".processing".to_string(),
                "[aria-busy=\"true\"]".to_string(),
            ],
            completion_indicators: vec!["button:not([disabled])".to_string()],
            wait_strategy: WaitStrategy::NetworkIdle,
        }
    }
}
