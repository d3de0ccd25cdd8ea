use thiserror::Error;

use browser_adapter::DriverError;

/// Errors raised by the wait strategies. Timeouts are surfaced internally and
/// converted into a failure [`crate::CompletionReport`] by the public API.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("completion wait timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),
}
