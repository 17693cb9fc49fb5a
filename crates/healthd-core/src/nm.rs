//! Node-manager (ME) self-test monitor.
//!
//! Each server slot's management engine is asked for its self-test result.
//! A missing or abnormal answer must repeat `retry_threshold` times before it
//! is reported, and each condition is reported once until a normal answer
//! clears it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::{NM_SELFTEST_OK, Platform};
use crate::supervisor::{Monitor, Poll};

/// `nm_monitor` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NmConfig {
    pub enabled: bool,
    pub monitor_interval: i64,
    /// Clamped to `0..=255` when parsed.
    #[serde(deserialize_with = "saturating_u8")]
    pub retry_threshold: u8,
}

/// Accept any JSON integer and clamp it into a `u8`.
fn saturating_u8<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Saturating;

    impl serde::de::Visitor<'_> for Saturating {
        type Value = u8;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("an integer")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u8, E> {
            Ok(u8::try_from(v).unwrap_or(u8::MAX))
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u8, E> {
            Ok(u8::try_from(v.max(0)).unwrap_or(u8::MAX))
        }
    }

    deserializer.deserialize_any(Saturating)
}

impl Default for NmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            monitor_interval: 1,
            retry_threshold: 0,
        }
    }
}

impl NmConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.monitor_interval).unwrap_or(0).max(1))
    }
}

/// Classified self-test answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestResult {
    Normal,
    Abnormal,
    NotSupported,
}

impl SelfTestResult {
    /// Classify a platform answer; an error means no response.
    #[must_use]
    pub fn classify<E>(answer: &Result<[u8; 2], E>) -> Self {
        match answer {
            Ok(bytes) if *bytes == NM_SELFTEST_OK => Self::Normal,
            Ok(_) => Self::Abnormal,
            Err(_) => Self::NotSupported,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FruRetry {
    no_response: u8,
    abnormal: u8,
    unavailable_logged: bool,
    degraded_logged: bool,
}

/// Per-FRU retry counters and reported-condition flags.
#[derive(Debug, Clone, Default)]
pub struct NmTracker {
    retry_threshold: u8,
    frus: HashMap<u8, FruRetry>,
}

impl NmTracker {
    #[must_use]
    pub fn new(retry_threshold: u8) -> Self {
        Self {
            retry_threshold,
            frus: HashMap::new(),
        }
    }

    /// Fold one result for `fru` (display name `fru_name`) into its state.
    pub fn observe(&mut self, fru: u8, fru_name: &str, result: SelfTestResult) {
        let threshold = self.retry_threshold;
        let state = self.frus.entry(fru).or_default();
        match result {
            SelfTestResult::NotSupported => {
                if state.no_response < threshold {
                    state.no_response += 1;
                } else if !state.unavailable_logged {
                    state.unavailable_logged = true;
                    tracing::error!(
                        fru,
                        "ASSERT: ME Status - Controller Unavailable on the {fru_name}"
                    );
                }
            }
            SelfTestResult::Abnormal => {
                if state.abnormal < threshold {
                    state.abnormal += 1;
                } else if !state.degraded_logged {
                    state.degraded_logged = true;
                    tracing::error!(
                        fru,
                        "ASSERT: ME Status - Controller Access Degraded or Unavailable on the {fru_name}"
                    );
                }
            }
            SelfTestResult::Normal => {
                if state.degraded_logged {
                    state.degraded_logged = false;
                    tracing::error!(
                        fru,
                        "DEASSERT: ME Status - Controller Access Degraded or Unavailable on the {fru_name}"
                    );
                }
                if state.unavailable_logged {
                    state.unavailable_logged = false;
                    tracing::error!(
                        fru,
                        "DEASSERT: ME Status - Controller Unavailable on the {fru_name}"
                    );
                }
                state.no_response = 0;
                state.abnormal = 0;
            }
        }
    }

    /// `(no_response, abnormal)` retry counters of `fru`.
    #[must_use]
    pub fn counters(&self, fru: u8) -> (u8, u8) {
        self.frus
            .get(&fru)
            .map_or((0, 0), |s| (s.no_response, s.abnormal))
    }
}

/// Polls every server slot not currently being updated.
pub struct NmMonitor {
    platform: Arc<dyn Platform>,
    tracker: NmTracker,
    interval: Duration,
}

impl NmMonitor {
    pub fn new(platform: Arc<dyn Platform>, config: &NmConfig) -> Self {
        Self {
            platform,
            tracker: NmTracker::new(config.retry_threshold),
            interval: config.interval(),
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &NmTracker {
        &self.tracker
    }
}

impl Monitor for NmMonitor {
    fn name(&self) -> &'static str {
        "nm"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn poll(&mut self) -> Poll {
        for fru in 1..=self.platform.max_frus() {
            if !self.platform.is_slot_server(fru) || self.platform.is_fw_update_ongoing(fru) {
                continue;
            }
            let result = SelfTestResult::classify(&self.platform.nm_selftest(fru));
            let name = self.platform.fru_name(fru);
            tracing::trace!(fru, ?result, "node manager self-test");
            self.tracker.observe(fru, &name, result);
        }
        Poll::Continue
    }
}
