//! Batch execution engine.
//!
//! Takes a list of prompts, drives them through one browser session in the
//! selected execution mode (sequential, step-by-step with approvals, or
//! windowed-parallel) and reports per-task outcomes. The scheduler owns the
//! session lifecycle: one driver per run, cleaned up on every exit path.

pub mod analyzer;
pub mod error;
pub mod model;
pub mod scheduler;

pub use analyzer::{AnalyzeError, ConfidenceAnalyzer, ScriptedAnalyzer};
pub use error::ScheduleError;
pub use model::{BatchOptions, BatchReport, BatchSpec, ExecutionMode, PromptSpec};
pub use scheduler::BatchScheduler;
