//! Shared data model for the PromptPilot orchestration core.
//!
//! Hosts the ids, status machines and record types that the detector, gate,
//! scheduler and orchestrator crates all wire against.

pub mod confidence;
pub mod ids;
pub mod model;
pub mod status;

pub use confidence::{ConfidenceLevel, ConfidenceReport, Recommendation};
pub use ids::{ApprovalId, BatchId, JobId, TaskId};
pub use model::{BatchProgress, Intervention, Job, Task};
pub use status::{BatchStatus, JobStatus, TaskStatus};
