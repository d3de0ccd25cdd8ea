//! Browser driver seam for the PromptPilot orchestration core.
//!
//! The core never talks to a real browser directly; it drives this trait.
//! Concrete CDP/WebDriver integrations live outside the core, while the
//! [`ScriptedDriver`] test double ships here so every layer can exercise the
//! seam without a browser.

pub mod driver;
pub mod error;
pub mod scripted;

pub use driver::{BrowserDriver, DriverFactory};
pub use error::{DriverError, DriverErrorKind};
pub use scripted::{ScriptedDriver, ScriptedFactory};
