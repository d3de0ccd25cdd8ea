use thiserror::Error;

use approval_gate::GateError;
use batch_scheduler::ScheduleError;
use promptpilot_core_types::JobId;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Gate(#[from] GateError),
}
