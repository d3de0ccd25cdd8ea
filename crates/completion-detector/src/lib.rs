//! Completion detection for heterogeneous AI web interfaces.
//!
//! AI chat frontends expose no standard "generation finished" event, so this
//! crate fingerprints the target application and runs a per-platform polling
//! strategy to decide when it is idle and ready for the next prompt, with a
//! generic network-idle fallback for unknown targets.

pub mod detector;
pub mod error;
pub mod profile;
pub mod signatures;

pub use detector::{CompletionDetector, CompletionReport, DetectorConfig};
pub use error::DetectError;
pub use profile::{PlatformProfile, WaitStrategy};
pub use signatures::{PlatformSignature, SIGNATURES};
