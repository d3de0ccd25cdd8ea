//! Job lifecycle coordination.
//!
//! The orchestrator owns jobs end to end: it builds tasks from a job spec,
//! picks the execution mode, hands the batch to the scheduler, applies the
//! outcomes back onto the job and archives it into a bounded history. It also
//! fronts the approval gate for human responses and aggregates health across
//! its collaborators.

pub mod analyzer;
pub mod error;
pub mod orchestrator;
pub mod textgen;

pub use analyzer::TextGenAnalyzer;
pub use error::OrchestratorError;
pub use orchestrator::{HealthReport, JobReport, JobSpec, JobStatusView, Orchestrator};
pub use textgen::{GenerationOutcome, MockTextGen, TextGenerationClient};
