use thiserror::Error;

use approval_gate::GateError;
use browser_adapter::DriverError;
use promptpilot_core_types::BatchId;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("batch {0} is already running")]
    AlreadyRunning(BatchId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("approval gate error: {0}")]
    Gate(#[from] GateError),
}
