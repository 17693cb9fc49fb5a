//! ECC error-counter monitor.
//!
//! Reads the SDRAM memory controller interrupt/status register once per poll
//! and checks the recoverable and unrecoverable error counters against
//! thresholds configured as a percentage of each counter's maximum.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::HealthAggregator;
use crate::error::Result;
use crate::platform::Platform;
use crate::registers::PhysicalMemory;
use crate::supervisor::{Monitor, Poll};
use crate::threshold::{
    CheckOutcome, SignalKind, Threshold, ThresholdConfig, ThresholdSet, thresholds_from_config,
};

/// SDRAM memory controller register base.
pub const MCR_BASE: u64 = 0x1E6E_0000;
/// Interrupt control/status register.
pub const INTR_CTRL_STS_OFFSET: usize = 0x50;
/// Address of the first unrecoverable ECC error.
pub const FIRST_UNRECOVERABLE_ADDR_OFFSET: usize = 0x58;
/// Address of the last recoverable ECC error.
pub const LAST_RECOVERABLE_ADDR_OFFSET: usize = 0x5C;

pub const DEFAULT_RECOVERABLE_MAX: u32 = 255;
pub const DEFAULT_UNRECOVERABLE_MAX: u32 = 15;

/// Delay before retrying after `/dev/mem` could not be mapped.
pub const MAP_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Consecutive mapping failures between two error log lines.
pub const MAP_FAILURE_LOG_EVERY: u32 = 600;

// =============================================================================
// Configuration
// =============================================================================

/// `ecc_monitoring` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EccConfig {
    pub enabled: bool,
    pub ecc_address_log: bool,
    pub monitor_interval: i64,
    pub recov_max_counter: u32,
    pub unrec_max_counter: u32,
    pub recov_threshold: Vec<ThresholdConfig>,
    pub unrec_threshold: Vec<ThresholdConfig>,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ecc_address_log: false,
            monitor_interval: 1,
            recov_max_counter: DEFAULT_RECOVERABLE_MAX,
            unrec_max_counter: DEFAULT_UNRECOVERABLE_MAX,
            recov_threshold: Vec::new(),
            unrec_threshold: Vec::new(),
        }
    }
}

impl EccConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.monitor_interval).unwrap_or(0).max(1))
    }
}

// =============================================================================
// Register decoding
// =============================================================================

/// One read of the ECC registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EccStatus {
    pub status: u32,
    pub first_unrecoverable_addr: u32,
    pub last_recoverable_addr: u32,
}

impl EccStatus {
    /// Bits 16..24 of the status register.
    #[must_use]
    pub const fn recoverable_count(&self) -> u32 {
        (self.status >> 16) & 0xFF
    }

    /// Bits 12..16 of the status register.
    #[must_use]
    pub const fn unrecoverable_count(&self) -> u32 {
        (self.status >> 12) & 0xF
    }
}

// =============================================================================
// Monitor
// =============================================================================

struct EccCounter {
    set: ThresholdSet,
    /// Configured percentages, index-aligned with `set`.
    percents: Vec<f64>,
}

impl EccCounter {
    fn new(
        kind: SignalKind,
        max_counter: u32,
        thresholds: Vec<Threshold>,
        aggregator: Arc<HealthAggregator>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let percents = thresholds.iter().map(|t| t.value).collect();
        let scaled = thresholds
            .iter()
            .map(|t| t.to_counter_scale(max_counter))
            .collect();
        Self {
            set: ThresholdSet::new(kind, scaled, aggregator, platform),
            percents,
        }
    }

    fn check(&mut self, count: u32, addr: Option<u32>) -> CheckOutcome {
        let outcome = self.set.check(f64::from(count));
        for assert in outcome.asserts() {
            if self.set.thresholds()[assert.index].log.is_none() {
                continue;
            }
            let pct = self.percents[assert.index] as i64;
            let name = self.set.name();
            match addr {
                Some(addr) => tracing::error!(
                    signal = %name,
                    counter = count,
                    "{name} occurred (over {pct}%) Counter = {count} Address of last recoverable ECC error = {:#x}",
                    addr >> 4
                ),
                None => tracing::error!(
                    signal = %name,
                    counter = count,
                    "ECC occurred (over {pct}%): {name} Counter = {count}"
                ),
            }
        }
        outcome
    }
}

/// ECC monitor (`ecc_monitoring`).
pub struct EccMonitor {
    memory: Arc<dyn PhysicalMemory>,
    recoverable: EccCounter,
    unrecoverable: EccCounter,
    address_log: bool,
    interval: Duration,
    map_failures: u32,
}

impl EccMonitor {
    pub fn new(
        memory: Arc<dyn PhysicalMemory>,
        config: &EccConfig,
        aggregator: Arc<HealthAggregator>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            memory,
            recoverable: EccCounter::new(
                SignalKind::RecoverableEcc,
                config.recov_max_counter,
                thresholds_from_config(&config.recov_threshold),
                aggregator.clone(),
                platform.clone(),
            ),
            unrecoverable: EccCounter::new(
                SignalKind::UnrecoverableEcc,
                config.unrec_max_counter,
                thresholds_from_config(&config.unrec_threshold),
                aggregator,
                platform,
            ),
            address_log: config.ecc_address_log,
            interval: config.interval(),
            map_failures: 0,
        }
    }

    /// Map the controller window and read the registers of interest.
    pub fn read_status(&self) -> Result<EccStatus> {
        let window = self.memory.map(MCR_BASE)?;
        let mut status = EccStatus {
            status: window.read_u32(INTR_CTRL_STS_OFFSET)?,
            ..EccStatus::default()
        };
        if self.address_log {
            status.first_unrecoverable_addr = window.read_u32(FIRST_UNRECOVERABLE_ADDR_OFFSET)?;
            status.last_recoverable_addr = window.read_u32(LAST_RECOVERABLE_ADDR_OFFSET)?;
        }
        Ok(status)
    }

    #[must_use]
    pub fn recoverable_thresholds(&self) -> &ThresholdSet {
        &self.recoverable.set
    }

    #[must_use]
    pub fn unrecoverable_thresholds(&self) -> &ThresholdSet {
        &self.unrecoverable.set
    }
}

impl Monitor for EccMonitor {
    fn name(&self) -> &'static str {
        "ecc"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn poll(&mut self) -> Poll {
        let status = match self.read_status() {
            Ok(status) => status,
            Err(err) => {
                self.map_failures += 1;
                if self.map_failures >= MAP_FAILURE_LOG_EVERY {
                    tracing::error!(error = %err, "ECC monitor cannot open /dev/mem");
                    self.map_failures = 0;
                }
                return Poll::RetryAfter(MAP_RETRY_DELAY);
            }
        };
        self.map_failures = 0;

        let recov_addr = self.address_log.then_some(status.last_recoverable_addr);
        let outcome = self
            .recoverable
            .check(status.recoverable_count(), recov_addr);
        if let Some(request) = outcome.reboot {
            return Poll::Reboot(request);
        }

        let unrec_addr = self.address_log.then_some(status.first_unrecoverable_addr);
        let outcome = self
            .unrecoverable
            .check(status.unrecoverable_count(), unrec_addr);
        if let Some(request) = outcome.reboot {
            return Poll::Reboot(request);
        }
        Poll::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::HealthBit;
    use crate::kv::{BMC_HEALTH_KEY, MemoryKvStore};
    use crate::logging::test_support::capture_logs;
    use crate::platform::RecordingPlatform;
    use crate::registers::SimulatedMemory;

    fn monitor(config: &EccConfig) -> (Arc<SimulatedMemory>, Arc<MemoryKvStore>, Arc<HealthAggregator>, EccMonitor) {
        let mem = Arc::new(SimulatedMemory::new());
        let kv = Arc::new(MemoryKvStore::new());
        let agg = Arc::new(HealthAggregator::new(kv.clone()));
        let m = EccMonitor::new(mem.clone(), config, agg.clone(), Arc::new(RecordingPlatform::new()));
        (mem, kv, agg, m)
    }

    fn config(json: &str) -> EccConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn counter_fields() {
        let s = EccStatus {
            status: (0xAB << 16) | (0x7 << 12) | 0xFFF,
            ..EccStatus::default()
        };
        assert_eq!(s.recoverable_count(), 0xAB);
        assert_eq!(s.unrecoverable_count(), 0x7);
    }

    #[test]
    fn config_defaults() {
        let c = config("{}");
        assert_eq!(c.recov_max_counter, 255);
        assert_eq!(c.unrec_max_counter, 15);
        assert!(!c.ecc_address_log);
        assert!(c.recov_threshold.is_empty());
    }

    #[test]
    fn recoverable_assert_and_deassert_drive_health() {
        let c = config(
            r#"{"enabled": true, "recov_max_counter": 255,
                "recov_threshold": [{"value": 50.0, "action": ["bmc-error-trigger"]}]}"#,
        );
        let (mem, kv, agg, mut m) = monitor(&c);
        mem.write_u32(MCR_BASE, INTR_CTRL_STS_OFFSET, 130 << 16);
        assert!(matches!(m.poll(), Poll::Continue));
        assert!(agg.is_set(HealthBit::RecoverableEcc));
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0"]);

        mem.write_u32(MCR_BASE, INTR_CTRL_STS_OFFSET, 0);
        m.poll();
        assert_eq!(agg.bits(), 0);
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0", "1"]);
    }

    #[test]
    fn below_converted_threshold_stays_quiet() {
        let c = config(r#"{"recov_threshold": [{"value": 50.0, "action": ["bmc-error-trigger"]}]}"#);
        let (mem, _kv, agg, mut m) = monitor(&c);
        mem.write_u32(MCR_BASE, INTR_CTRL_STS_OFFSET, 127 << 16);
        m.poll();
        assert_eq!(agg.bits(), 0);
        assert!(!m.recoverable_thresholds().thresholds()[0].is_asserted());
    }

    #[test]
    fn diagnostic_line_without_address() {
        let c = config(r#"{"unrec_threshold": [{"value": 20.0, "action": ["log-critical"]}]}"#);
        let (mem, _kv, _agg, mut m) = monitor(&c);
        mem.write_u32(MCR_BASE, INTR_CTRL_STS_OFFSET, 4 << 12);
        let ((), logs) = capture_logs(|| {
            m.poll();
            m.poll();
        });
        assert_eq!(
            logs.count("ECC occurred (over 20%): ECC Unrecoverable Error Counter = 4"),
            1
        );
        assert_eq!(logs.count(" ASSERT: ECC Unrecoverable Error"), 1);
    }

    #[test]
    fn diagnostic_line_with_address() {
        let c = config(
            r#"{"ecc_address_log": true,
                "recov_threshold": [{"value": 10.0, "action": ["log-warning"]}]}"#,
        );
        let (mem, _kv, _agg, mut m) = monitor(&c);
        mem.write_u32(MCR_BASE, INTR_CTRL_STS_OFFSET, 30 << 16);
        mem.write_u32(MCR_BASE, LAST_RECOVERABLE_ADDR_OFFSET, 0x1230);
        let ((), logs) = capture_logs(|| {
            m.poll();
        });
        assert!(logs.contents().contains(
            "ECC Recoverable Error occurred (over 10%) Counter = 30 Address of last recoverable ECC error = 0x123"
        ));
    }

    #[test]
    fn map_failures_retry_and_rate_limit() {
        let (mem, _kv, _agg, mut m) = monitor(&EccConfig::default());
        mem.fail_next_maps(MAP_FAILURE_LOG_EVERY);
        let ((), logs) = capture_logs(|| {
            for _ in 0..MAP_FAILURE_LOG_EVERY {
                assert!(matches!(m.poll(), Poll::RetryAfter(d) if d == MAP_RETRY_DELAY));
            }
        });
        assert_eq!(logs.count("cannot open /dev/mem"), 1);
        assert!(matches!(m.poll(), Poll::Continue));
    }

    #[test]
    fn reboot_threshold_requests_reboot() {
        let c = config(r#"{"unrec_threshold": [{"value": 10.0, "action": ["reboot"]}]}"#);
        let (mem, _kv, _agg, mut m) = monitor(&c);
        mem.write_u32(MCR_BASE, INTR_CTRL_STS_OFFSET, 2 << 12);
        assert!(matches!(m.poll(), Poll::Reboot(_)));
    }
}
