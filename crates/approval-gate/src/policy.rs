use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Auto-approval policy.
///
/// Precedence: the never-approve list always forces a human response, the
/// always-approve list always bypasses, and anything else auto-approves only
/// when its confidence clears the threshold and the action type is not on the
/// requires-oversight list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatePolicy {
    pub enabled: bool,
    pub auto_approve_threshold: f64,
    /// Action types needing a human even at high confidence.
    pub requires_oversight: Vec<String>,
    /// Action types that bypass review regardless of confidence.
    pub always_approve: Vec<String>,
    /// Action types that must never auto-approve.
    pub never_approve: Vec<String>,
    /// Default bound for `wait_for_approval`.
    #[serde(with = "humantime_serde_seconds")]
    pub default_timeout: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_approve_threshold: 0.8,
            requires_oversight: vec!["navigate".to_string(), "extract".to_string()],
            always_approve: Vec::new(),
            never_approve: vec![
                "delete".to_string(),
                "purchase".to_string(),
                "submit_form".to_string(),
            ],
            default_timeout: Duration::from_secs(300),
        }
    }
}

impl GatePolicy {
    pub fn should_auto_approve(
        &self,
        action_type: &str,
        confidence: f64,
        threshold_override: Option<f64>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if self.never_approve.iter().any(|a| a == action_type) {
            return false;
        }
        if self.always_approve.iter().any(|a| a == action_type) {
            return true;
        }
        let threshold = threshold_override.unwrap_or(self.auto_approve_threshold);
        confidence >= threshold && !self.requires_oversight.iter().any(|a| a == action_type)
    }
}

/// Serialize the timeout as whole seconds so policy snapshots stay readable.
mod humantime_serde_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
