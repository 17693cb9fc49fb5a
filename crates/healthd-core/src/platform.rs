//! Platform collaborator (the board-specific layer behind the daemon).
//!
//! [`GenericPlatform`] covers what is portable across Linux BMCs: a sysfs
//! LED, `/dev/watchdog`, and log lines for error notifications. Vendor
//! queries (I2C controller status, FRU topology, node-manager self-test)
//! report [`HealthError::Unsupported`].

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{HealthError, Result};

/// Normal node-manager self-test response.
pub const NM_SELFTEST_OK: [u8; 2] = [0x55, 0x00];

/// Board services used by the monitors.
pub trait Platform: Send + Sync {
    /// A monitored condition with `bmc-error-trigger` became active.
    fn bmc_error_enable(&self, signal: &str);

    /// The condition cleared.
    fn bmc_error_disable(&self, signal: &str);

    /// Raw controller status word of I2C bus `bus`.
    fn i2c_bus_status(&self, bus: u8) -> Result<u32>;

    fn i2c_crash_assert(&self, bus: u8);

    fn i2c_crash_deassert(&self, bus: u8);

    /// Highest FRU id (FRU ids start at 1).
    fn max_frus(&self) -> u8;

    fn fru_name(&self, fru: u8) -> String;

    fn is_slot_server(&self, fru: u8) -> bool;

    fn is_fw_update_ongoing(&self, fru: u8) -> bool;

    /// Any firmware update in progress anywhere on the system.
    fn is_fw_update_ongoing_system(&self) -> bool;

    /// Node-manager self-test bytes. `Err` when the controller does not answer.
    fn nm_selftest(&self, fru: u8) -> Result<[u8; 2]>;

    fn set_heartbeat_led(&self, on: bool) -> Result<()>;

    fn kick_watchdog(&self) -> Result<()>;
}

// =============================================================================
// GenericPlatform
// =============================================================================

/// Portable [`Platform`] implementation.
#[derive(Debug)]
pub struct GenericPlatform {
    heartbeat_led: Option<PathBuf>,
    watchdog_path: PathBuf,
    watchdog: Mutex<Option<File>>,
}

impl GenericPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heartbeat_led: None,
            watchdog_path: PathBuf::from("/dev/watchdog"),
            watchdog: Mutex::new(None),
        }
    }

    /// Drive the heartbeat through a sysfs `brightness` file.
    #[must_use]
    pub fn with_heartbeat_led(mut self, brightness: impl Into<PathBuf>) -> Self {
        self.heartbeat_led = Some(brightness.into());
        self
    }

    #[must_use]
    pub fn with_watchdog(mut self, device: impl Into<PathBuf>) -> Self {
        self.watchdog_path = device.into();
        self
    }
}

impl Default for GenericPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for GenericPlatform {
    fn bmc_error_enable(&self, signal: &str) {
        tracing::info!(signal, "BMC error indication enabled");
    }

    fn bmc_error_disable(&self, signal: &str) {
        tracing::info!(signal, "BMC error indication disabled");
    }

    fn i2c_bus_status(&self, _bus: u8) -> Result<u32> {
        Err(HealthError::Unsupported("i2c bus status"))
    }

    fn i2c_crash_assert(&self, bus: u8) {
        tracing::debug!(bus, "I2C crash assert");
    }

    fn i2c_crash_deassert(&self, bus: u8) {
        tracing::debug!(bus, "I2C crash deassert");
    }

    fn max_frus(&self) -> u8 {
        0
    }

    fn fru_name(&self, fru: u8) -> String {
        format!("fru{fru}")
    }

    fn is_slot_server(&self, _fru: u8) -> bool {
        false
    }

    fn is_fw_update_ongoing(&self, _fru: u8) -> bool {
        false
    }

    fn is_fw_update_ongoing_system(&self) -> bool {
        false
    }

    fn nm_selftest(&self, _fru: u8) -> Result<[u8; 2]> {
        Err(HealthError::Unsupported("node manager self-test"))
    }

    fn set_heartbeat_led(&self, on: bool) -> Result<()> {
        let path = self
            .heartbeat_led
            .as_ref()
            .ok_or(HealthError::Unsupported("heartbeat LED"))?;
        std::fs::write(path, if on { "1" } else { "0" })?;
        Ok(())
    }

    fn kick_watchdog(&self) -> Result<()> {
        let mut guard = self.watchdog.lock();
        if guard.is_none() {
            *guard = Some(
                std::fs::OpenOptions::new()
                    .write(true)
                    .open(&self.watchdog_path)?,
            );
        }
        if let Some(file) = guard.as_mut() {
            if let Err(err) = file.write_all(b"k") {
                *guard = None;
                return Err(err.into());
            }
        }
        Ok(())
    }
}

// =============================================================================
// RecordingPlatform
// =============================================================================

/// A side effect requested through [`Platform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    BmcErrorEnable(String),
    BmcErrorDisable(String),
    I2cCrashAssert(u8),
    I2cCrashDeassert(u8),
    HeartbeatLed(bool),
    WatchdogKick,
}

/// Scriptable [`Platform`] that records every side effect.
///
/// Queued I2C statuses and self-test results are consumed one per query; an
/// empty queue repeats the last configured default.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    inner: Mutex<RecordingInner>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    events: Vec<PlatformEvent>,
    i2c_status: HashMap<u8, VecDeque<Option<u32>>>,
    nm_results: HashMap<u8, VecDeque<Option<[u8; 2]>>>,
    server_frus: Vec<u8>,
    updating_frus: Vec<u8>,
    system_updates: VecDeque<bool>,
    system_updating: bool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// FRUs reported as server slots; `max_frus` is the largest.
    #[must_use]
    pub fn with_server_frus(self, frus: &[u8]) -> Self {
        self.inner.lock().server_frus = frus.to_vec();
        self
    }

    pub fn set_fru_updating(&self, fru: u8, updating: bool) {
        let mut inner = self.inner.lock();
        inner.updating_frus.retain(|f| *f != fru);
        if updating {
            inner.updating_frus.push(fru);
        }
    }

    /// Queue a status word (`None` = query failure) for `bus`.
    pub fn push_i2c_status(&self, bus: u8, status: Option<u32>) {
        self.inner
            .lock()
            .i2c_status
            .entry(bus)
            .or_default()
            .push_back(status);
    }

    /// Queue a self-test answer (`None` = no response) for `fru`.
    pub fn push_nm_result(&self, fru: u8, result: Option<[u8; 2]>) {
        self.inner
            .lock()
            .nm_results
            .entry(fru)
            .or_default()
            .push_back(result);
    }

    /// Queue answers for `is_fw_update_ongoing_system`.
    pub fn push_system_update(&self, updating: bool) {
        self.inner.lock().system_updates.push_back(updating);
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        self.inner.lock().events.clone()
    }

    fn record(&self, event: PlatformEvent) {
        self.inner.lock().events.push(event);
    }
}

impl Platform for RecordingPlatform {
    fn bmc_error_enable(&self, signal: &str) {
        self.record(PlatformEvent::BmcErrorEnable(signal.to_string()));
    }

    fn bmc_error_disable(&self, signal: &str) {
        self.record(PlatformEvent::BmcErrorDisable(signal.to_string()));
    }

    fn i2c_bus_status(&self, bus: u8) -> Result<u32> {
        let mut inner = self.inner.lock();
        let queue = inner.i2c_status.entry(bus).or_default();
        let next = if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().copied().flatten()
        };
        next.ok_or_else(|| HealthError::Platform(format!("i2c-{bus} status unavailable")))
    }

    fn i2c_crash_assert(&self, bus: u8) {
        self.record(PlatformEvent::I2cCrashAssert(bus));
    }

    fn i2c_crash_deassert(&self, bus: u8) {
        self.record(PlatformEvent::I2cCrashDeassert(bus));
    }

    fn max_frus(&self) -> u8 {
        self.inner
            .lock()
            .server_frus
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
    }

    fn fru_name(&self, fru: u8) -> String {
        format!("slot{fru}")
    }

    fn is_slot_server(&self, fru: u8) -> bool {
        self.inner.lock().server_frus.contains(&fru)
    }

    fn is_fw_update_ongoing(&self, fru: u8) -> bool {
        self.inner.lock().updating_frus.contains(&fru)
    }

    fn is_fw_update_ongoing_system(&self) -> bool {
        let mut inner = self.inner.lock();
        if let Some(next) = inner.system_updates.pop_front() {
            inner.system_updating = next;
        }
        inner.system_updating
    }

    fn nm_selftest(&self, fru: u8) -> Result<[u8; 2]> {
        let mut inner = self.inner.lock();
        let queue = inner.nm_results.entry(fru).or_default();
        let next = if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().copied().flatten()
        };
        next.ok_or_else(|| HealthError::Platform(format!("no self-test response from fru {fru}")))
    }

    fn set_heartbeat_led(&self, on: bool) -> Result<()> {
        self.record(PlatformEvent::HeartbeatLed(on));
        Ok(())
    }

    fn kick_watchdog(&self) -> Result<()> {
        self.record(PlatformEvent::WatchdogKick);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_vendor_queries_unsupported() {
        let p = GenericPlatform::new();
        assert!(matches!(p.i2c_bus_status(0), Err(HealthError::Unsupported(_))));
        assert!(matches!(p.nm_selftest(1), Err(HealthError::Unsupported(_))));
        assert!(matches!(p.set_heartbeat_led(true), Err(HealthError::Unsupported(_))));
        assert_eq!(p.max_frus(), 0);
        assert!(!p.is_fw_update_ongoing_system());
    }

    #[test]
    fn generic_led_writes_brightness() {
        let dir = tempfile::tempdir().unwrap();
        let led = dir.path().join("brightness");
        let p = GenericPlatform::new().with_heartbeat_led(&led);
        p.set_heartbeat_led(true).unwrap();
        assert_eq!(std::fs::read_to_string(&led).unwrap(), "1");
        p.set_heartbeat_led(false).unwrap();
        assert_eq!(std::fs::read_to_string(&led).unwrap(), "0");
    }

    #[test]
    fn generic_watchdog_kicks_device() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("watchdog");
        std::fs::write(&dev, "").unwrap();
        let p = GenericPlatform::new().with_watchdog(&dev);
        p.kick_watchdog().unwrap();
        p.kick_watchdog().unwrap();
        assert_eq!(std::fs::read_to_string(&dev).unwrap(), "kk");

        let missing = GenericPlatform::new().with_watchdog(dir.path().join("nope/wd"));
        assert!(missing.kick_watchdog().is_err());
    }

    #[test]
    fn recording_queues_repeat_last_value() {
        let p = RecordingPlatform::new();
        p.push_i2c_status(3, Some(1));
        p.push_i2c_status(3, Some(0));
        assert_eq!(p.i2c_bus_status(3).unwrap(), 1);
        assert_eq!(p.i2c_bus_status(3).unwrap(), 0);
        assert_eq!(p.i2c_bus_status(3).unwrap(), 0);
        assert!(p.i2c_bus_status(4).is_err());
    }

    #[test]
    fn recording_tracks_frus_and_events() {
        let p = RecordingPlatform::new().with_server_frus(&[1, 2, 4]);
        assert_eq!(p.max_frus(), 4);
        assert!(p.is_slot_server(2));
        assert!(!p.is_slot_server(3));
        p.set_fru_updating(2, true);
        assert!(p.is_fw_update_ongoing(2));
        p.set_fru_updating(2, false);
        assert!(!p.is_fw_update_ongoing(2));

        p.bmc_error_enable("BMC CPU utilization");
        p.i2c_crash_assert(5);
        assert_eq!(
            p.events(),
            vec![
                PlatformEvent::BmcErrorEnable("BMC CPU utilization".to_string()),
                PlatformEvent::I2cCrashAssert(5),
            ]
        );
    }
}
