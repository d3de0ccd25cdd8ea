use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Confidence bands driving the approval gate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    /// Score below 0.3; always a candidate for review.
    Low,
    /// Score in [0.3, 0.7).
    Medium,
    /// Score at or above 0.7.
    High,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            ConfidenceLevel::Low
        } else if score < 0.7 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    ReviewNeeded,
}

/// Per-dimension confidence analysis of a task, produced before execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub scores: HashMap<String, f64>,
    pub overall: f64,
    pub recommendation: Recommendation,
}

impl ConfidenceReport {
    /// Combine the four analysis dimensions into an overall score. Success
    /// probability dominates; risk, complexity and oversight pull downward.
    pub fn weighted(complexity: f64, risk: f64, success: f64, oversight: f64) -> Self {
        let overall = success * 0.4
            + (1.0 - risk) * 0.3
            + (1.0 - complexity) * 0.2
            + (1.0 - oversight) * 0.1;
        let mut scores = HashMap::new();
        scores.insert("complexity".to_string(), complexity);
        scores.insert("risk".to_string(), risk);
        scores.insert("success_probability".to_string(), success);
        scores.insert("oversight_needed".to_string(), oversight);
        Self {
            scores,
            overall,
            recommendation: if overall > 0.7 {
                Recommendation::Proceed
            } else {
                Recommendation::ReviewNeeded
            },
        }
    }

    /// Fallback used when the analysis backend is unavailable: low enough to
    /// route the task through human review rather than abort it.
    pub fn conservative_default() -> Self {
        let mut report = Self::weighted(0.5, 0.5, 0.5, 0.8);
        report.overall = 0.4;
        report.recommendation = Recommendation::ReviewNeeded;
        report
    }

    pub fn risk(&self) -> f64 {
        self.scores.get("risk").copied().unwrap_or(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_bands() {
        assert_eq!(ConfidenceLevel::from_score(0.1), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0.3), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.69), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.7), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.99), ConfidenceLevel::High);
    }

    #[test]
    fn weighted_overall_favours_success_probability() {
        let report = ConfidenceReport::weighted(0.5, 0.3, 0.8, 0.4);
        assert!((report.overall - 0.69).abs() < 1e-9);
        assert_eq!(report.recommendation, Recommendation::ReviewNeeded);

        let confident = ConfidenceReport::weighted(0.1, 0.1, 0.95, 0.1);
        assert_eq!(confident.recommendation, Recommendation::Proceed);
    }

    #[test]
    fn conservative_default_requests_review() {
        let report = ConfidenceReport::conservative_default();
        assert!((report.overall - 0.4).abs() < 1e-9);
        assert_eq!(report.recommendation, Recommendation::ReviewNeeded);
        assert!((report.scores["oversight_needed"] - 0.8).abs() < 1e-9);
    }
}
