use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use browser_adapter::BrowserDriver;

use crate::error::DetectError;
use crate::profile::{PlatformProfile, WaitStrategy};
use crate::signatures::{self, SIGNATURES};

/// Tuning knobs for the polling strategies. Defaults mirror production
/// behaviour; tests shrink them to milliseconds.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    /// Upper bound for a single completion wait.
    pub max_wait: Duration,
    /// Cadence shared by all polling strategies.
    pub poll_interval: Duration,
    /// Extra delay applied after an idle signal to let the UI settle.
    pub settle_delay: Duration,
    /// Bound for secondary probes (network idle after a completion signal).
    pub probe_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a completion wait. A timeout is reported here, not raised:
/// callers branch on `ready`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionReport {
    pub ready: bool,
    pub platform: String,
    pub strategy: WaitStrategy,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Decides when a target AI web application has finished generating and is
/// ready for the next prompt.
pub struct CompletionDetector {
    driver: Arc<dyn BrowserDriver>,
    config: DetectorConfig,
    cached: RwLock<Option<PlatformProfile>>,
}

impl CompletionDetector {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: DetectorConfig) -> Self {
        Self {
            driver,
            config,
            cached: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Fingerprint the target. Hostname match wins; otherwise each known
    /// signature's input descriptor is probed in the live DOM; otherwise the
    /// generic network-idle profile applies. The first answer is cached for
    /// the session, so repeated calls are idempotent.
    pub async fn detect_platform(&self, target: &str) -> PlatformProfile {
        if let Some(profile) = self.cached.read().clone() {
            return profile;
        }
        let profile = self.resolve(target).await;
        info!(
            target: "detector",
            platform = %profile.platform,
            strategy = profile.wait_strategy.as_str(),
            "platform detected"
        );
        *self.cached.write() = Some(profile.clone());
        profile
    }

    async fn resolve(&self, target: &str) -> PlatformProfile {
        if let Some(signature) = signatures::match_host(target) {
            return PlatformProfile::from_signature(signature);
        }
        debug!(target: "detector", url = target, "no hostname match, probing DOM");
        for signature in SIGNATURES {
            match self.driver.exists(signature.input_selector).await {
                Ok(true) => return PlatformProfile::from_signature(signature),
                Ok(false) => {}
                Err(err) => {
                    debug!(target: "detector", selector = signature.input_selector, error = %err, "probe failed");
                }
            }
        }
        warn!(target: "detector", url = target, "falling back to generic profile");
        PlatformProfile::generic()
    }

    async fn profile(&self) -> PlatformProfile {
        if let Some(profile) = self.cached.read().clone() {
            return profile;
        }
        let url = self.driver.current_url().await.unwrap_or_default();
        self.detect_platform(&url).await
    }

    /// Poll for any processing indicator. If none shows up before the
    /// timeout we assume processing started anyway: some frontends render no
    /// indicator at all, and a missed signal must not fail the prompt.
    pub async fn wait_for_processing_to_start(&self, timeout: Duration) -> bool {
        let profile = self.profile().await;
        let deadline = Instant::now() + timeout;
        let cadence = (self.config.poll_interval / 2).max(Duration::from_millis(1));
        while Instant::now() < deadline {
            if self.any_visible(&profile.processing_indicators).await {
                debug!(target: "detector", platform = %profile.platform, "processing started");
                return true;
            }
            sleep(cadence).await;
        }
        warn!(
            target: "detector",
            platform = %profile.platform,
            "no processing indicator appeared, assuming processing started"
        );
        true
    }

    /// Wait until the target is idle and ready for the next prompt, using
    /// the strategy selected for the detected platform.
    pub async fn wait_for_completion(&self, timeout: Duration) -> CompletionReport {
        let profile = self.profile().await;
        let started = Instant::now();
        let deadline = started + timeout;
        info!(
            target: "detector",
            platform = %profile.platform,
            strategy = profile.wait_strategy.as_str(),
            "waiting for completion"
        );

        let outcome = match profile.wait_strategy {
            WaitStrategy::ButtonStateChange => {
                self.wait_button_state(&profile, started, deadline).await
            }
            WaitStrategy::StopButtonDisappears => {
                self.wait_stop_button_gone(&profile, started, deadline).await
            }
            WaitStrategy::GenerationComplete => {
                self.wait_generation_complete(&profile, started, deadline).await
            }
            WaitStrategy::NetworkIdle => self.wait_network_idle(started, deadline).await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                info!(target: "detector", platform = %profile.platform, elapsed_ms, "target ready");
                CompletionReport {
                    ready: true,
                    platform: profile.platform,
                    strategy: profile.wait_strategy,
                    elapsed_ms,
                    error: None,
                }
            }
            Err(err) => {
                warn!(target: "detector", platform = %profile.platform, elapsed_ms, error = %err, "completion wait failed");
                CompletionReport {
                    ready: false,
                    platform: profile.platform,
                    strategy: profile.wait_strategy,
                    elapsed_ms,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Best-effort screenshot for operator review; failure is logged, never
    /// propagated.
    pub async fn diagnostic_screenshot(&self) -> Vec<u8> {
        match self.driver.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "detector", error = %err, "diagnostic screenshot failed");
                Vec::new()
            }
        }
    }

    async fn wait_button_state(
        &self,
        profile: &PlatformProfile,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), DetectError> {
        while Instant::now() < deadline {
            let processing = self.any_visible(&profile.processing_indicators).await;
            if !processing && self.submit_enabled(profile).await {
                return Ok(());
            }
            sleep(self.config.poll_interval).await;
        }
        Err(timeout_error(started))
    }

    async fn wait_stop_button_gone(
        &self,
        profile: &PlatformProfile,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), DetectError> {
        while Instant::now() < deadline {
            if !self.any_visible(&profile.processing_indicators).await {
                sleep(self.config.settle_delay).await;
                return Ok(());
            }
            sleep(self.config.poll_interval).await;
        }
        Err(timeout_error(started))
    }

    async fn wait_generation_complete(
        &self,
        profile: &PlatformProfile,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), DetectError> {
        while Instant::now() < deadline {
            if self.any_visible(&profile.completion_indicators).await
                && self
                    .driver
                    .wait_for_network_idle(self.config.probe_timeout)
                    .await
                    .is_ok()
            {
                return Ok(());
            }
            sleep(self.config.poll_interval).await;
        }
        Err(timeout_error(started))
    }

    async fn wait_network_idle(
        &self,
        started: Instant,
        deadline: Instant,
    ) -> Result<(), DetectError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.driver
            .wait_for_network_idle(remaining)
            .await
            .map_err(|_| DetectError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?;
        sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn submit_enabled(&self, profile: &PlatformProfile) -> bool {
        match self.driver.is_visible(&profile.submit_selector).await {
            Ok(true) => {}
            _ => return false,
        }
        matches!(
            self.driver
                .attribute(&profile.submit_selector, "disabled")
                .await,
            Ok(None)
        )
    }

    async fn any_visible(&self, selectors: &[String]) -> bool {
        for selector in selectors {
            if let Ok(true) = self.driver.is_visible(selector).await {
                return true;
            }
        }
        false
    }

}

fn timeout_error(started: Instant) -> DetectError {
    DetectError::Timeout {
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
