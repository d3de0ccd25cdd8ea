//! Deterministic driver used for tests and offline development.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::driver::{BrowserDriver, DriverFactory};
use crate::error::{DriverError, DriverErrorKind};

/// Scripted visibility of a selector across successive `is_visible` polls.
#[derive(Clone, Copy, Debug)]
pub enum Visibility {
    Always,
    Never,
    /// Visible for the first N polls, hidden afterwards. Models a processing
    /// indicator that clears once generation finishes.
    FirstPolls(usize),
}

/// In-memory [`BrowserDriver`] with scripted behaviour and call recording.
#[derive(Default)]
pub struct ScriptedDriver {
    calls: Mutex<Vec<String>>,
    init_count: AtomicUsize,
    cleanup_count: AtomicUsize,
    visibility: DashMap<String, Visibility>,
    poll_counts: DashMap<String, usize>,
    attributes: DashMap<String, Vec<(String, String)>>,
    existing: DashMap<String, bool>,
    url: Mutex<String>,
    fail_fill_times: AtomicUsize,
    fail_navigate: AtomicBool,
    fail_initialize: AtomicBool,
    op_delay: Mutex<Duration>,
    healthy: AtomicBool,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        let driver = Self {
            healthy: AtomicBool::new(true),
            ..Self::default()
        };
        Arc::new(driver)
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.lock() = url.into();
    }

    pub fn set_visibility(&self, selector: impl Into<String>, visibility: Visibility) {
        self.visibility.insert(selector.into(), visibility);
    }

    pub fn set_exists(&self, selector: impl Into<String>, exists: bool) {
        self.existing.insert(selector.into(), exists);
    }

    pub fn set_attribute(
        &self,
        selector: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.attributes
            .entry(selector.into())
            .or_default()
            .push((name.into(), value.into()));
    }

    /// Fail the next `n` fill calls with a retriable i/o error.
    pub fn fail_next_fills(&self, n: usize) {
        self.fail_fill_times.store(n, Ordering::SeqCst);
    }

    pub fn fail_navigation(&self, fail: bool) {
        self.fail_navigate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay applied to every fill call, useful for exercising cooperative
    /// pause/cancel boundaries mid-run.
    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn initialize(&self) -> Result<(), DriverError> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(DriverError::new(DriverErrorKind::Io).with_hint("scripted init failure"));
        }
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), DriverError> {
        self.cleanup_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.record(format!("navigate:{}", url));
        if self.fail_navigate.load(Ordering::SeqCst) {
            return Err(DriverError::new(DriverErrorKind::NavTimeout).with_hint(url.to_string()));
        }
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        let delay = *self.op_delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.record(format!("fill:{}:{}", selector, text));
        let remaining = self.fail_fill_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fill_times.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new(DriverErrorKind::TargetNotFound)
                .with_hint(selector.to_string())
                .retriable(true));
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.record(format!("click:{}", selector));
        Ok(())
    }

    async fn press(&self, key: &str) -> Result<(), DriverError> {
        self.record(format!("press:{}", key));
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, DriverError> {
        Ok(self
            .existing
            .get(selector)
            .map(|entry| *entry)
            .unwrap_or(false))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, DriverError> {
        let seen = {
            let mut count = self.poll_counts.entry(selector.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let visibility = self.visibility.get(selector).map(|entry| *entry);
        Ok(match visibility {
            Some(Visibility::Always) => true,
            Some(Visibility::FirstPolls(n)) => seen <= n,
            Some(Visibility::Never) | None => false,
        })
    }

    async fn attribute(
        &self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        Ok(self.attributes.get(selector).and_then(|attrs| {
            attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        }))
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.url.lock().clone())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Factory handing out a pre-configured scripted driver, so tests can inspect
/// the same instance the scheduler ran against.
pub struct ScriptedFactory {
    driver: Arc<ScriptedDriver>,
    fail_create: AtomicBool,
}

impl ScriptedFactory {
    pub fn new(driver: Arc<ScriptedDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn driver(&self) -> Arc<ScriptedDriver> {
        Arc::clone(&self.driver)
    }
}

#[async_trait]
impl DriverFactory for ScriptedFactory {
    async fn create(&self) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(
                DriverError::new(DriverErrorKind::SessionClosed).with_hint("factory disabled")
            );
        }
        Ok(Arc::clone(&self.driver) as Arc<dyn BrowserDriver>)
    }
}
