use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use batch_scheduler::{AnalyzeError, ConfidenceAnalyzer};
use promptpilot_core_types::ConfidenceReport;

use crate::textgen::TextGenerationClient;

/// Confidence analysis over a text generation backend. The model rates the
/// prompt on four dimensions and the weighted combination becomes the score
/// fed to the approval gate. Any backend or parse failure surfaces as an
/// `AnalyzeError`; the scheduler degrades that to conservative defaults.
pub struct TextGenAnalyzer {
    client: Arc<dyn TextGenerationClient>,
}

impl TextGenAnalyzer {
    pub fn new(client: Arc<dyn TextGenerationClient>) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct AnalysisScores {
    complexity: f64,
    risk: f64,
    success_probability: f64,
    oversight_needed: f64,
}

#[async_trait]
impl ConfidenceAnalyzer for TextGenAnalyzer {
    async fn analyze(&self, prompt: &str) -> Result<ConfidenceReport, AnalyzeError> {
        let context = json!({"purpose": "confidence_analysis"});
        let outcome = self
            .client
            .process(&analysis_prompt(prompt), &context)
            .await;
        if !outcome.success {
            return Err(AnalyzeError(
                outcome
                    .error
                    .unwrap_or_else(|| "text generation failed".to_string()),
            ));
        }

        let body = extract_json(&outcome.text)
            .ok_or_else(|| AnalyzeError("no JSON object in analysis reply".to_string()))?;
        let scores: AnalysisScores = serde_json::from_str(body)
            .map_err(|err| AnalyzeError(format!("unparsable analysis: {err}")))?;

        let report = ConfidenceReport::weighted(
            scores.complexity.clamp(0.0, 1.0),
            scores.risk.clamp(0.0, 1.0),
            scores.success_probability.clamp(0.0, 1.0),
            scores.oversight_needed.clamp(0.0, 1.0),
        );
        debug!(target: "orchestrator", overall = report.overall, "prompt analyzed");
        Ok(report)
    }
}

fn analysis_prompt(prompt: &str) -> String {
    format!(
        "Rate the following automation prompt on complexity, risk, \
         success_probability and oversight_needed, each 0.0-1.0. \
         Respond with a single JSON object.\n\nPrompt: {prompt}"
    )
}

/// Model replies often wrap the JSON object in prose; take the outermost
/// braces.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textgen::MockTextGen;

    #[tokio::test]
    async fn parses_scores_and_weights_them() {
        let client = MockTextGen::new();
        client.set_reply(
            r#"Here is my assessment: {"complexity":0.5,"risk":0.3,"success_probability":0.8,"oversight_needed":0.4} as requested."#,
        );
        let analyzer = TextGenAnalyzer::new(client);
        let report = analyzer.analyze("click the button").await.unwrap();
        assert!((report.overall - 0.69).abs() < 1e-9);
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_error() {
        let client = MockTextGen::new();
        client.fail(true);
        let analyzer = TextGenAnalyzer::new(client);
        assert!(analyzer.analyze("anything").await.is_err());
    }

    #[tokio::test]
    async fn garbage_reply_surfaces_as_error() {
        let client = MockTextGen::new();
        client.set_reply("I cannot rate this prompt.");
        let analyzer = TextGenAnalyzer::new(client);
        assert!(analyzer.analyze("anything").await.is_err());
    }

    #[tokio::test]
    async fn out_of_range_scores_are_clamped() {
        let client = MockTextGen::new();
        client.set_reply(
            r#"{"complexity":-0.5,"risk":0.0,"success_probability":1.7,"oversight_needed":0.0}"#,
        );
        let analyzer = TextGenAnalyzer::new(client);
        let report = analyzer.analyze("anything").await.unwrap();
        assert!(report.overall <= 1.0);
        assert!((report.scores["success_probability"] - 1.0).abs() < 1e-9);
    }
}
