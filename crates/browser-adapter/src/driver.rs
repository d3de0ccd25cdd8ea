use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;

/// Primitive browser operations consumed by the orchestration core.
///
/// `initialize` and `cleanup` are idempotent and safe to call repeatedly;
/// every run that acquires a session must release it through `cleanup` on all
/// exit paths.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn initialize(&self) -> Result<(), DriverError>;
    async fn cleanup(&self) -> Result<(), DriverError>;

    async fn navigate(&self, url: &str) -> Result<(), DriverError>;
    async fn fill(&self, selector: &str, text: &str) -> Result<(), DriverError>;
    async fn click(&self, selector: &str) -> Result<(), DriverError>;
    async fn press(&self, key: &str) -> Result<(), DriverError>;

    async fn exists(&self, selector: &str) -> Result<bool, DriverError>;
    async fn is_visible(&self, selector: &str) -> Result<bool, DriverError>;
    async fn attribute(&self, selector: &str, name: &str)
        -> Result<Option<String>, DriverError>;

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), DriverError>;
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;
    async fn current_url(&self) -> Result<String, DriverError>;

    async fn health_check(&self) -> bool;
}

/// Creates one driver per batch run so a browser session is never shared
/// across concurrently running jobs.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn BrowserDriver>, DriverError>;
}
