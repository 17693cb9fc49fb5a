//! Carrying out [`RebootRequest`]s.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{HealthError, Result};
use crate::metrics::HostMetrics;
use crate::threshold::RebootRequest;

/// Delay between the reboot log line and the reboot itself, so the line can
/// reach persistent storage.
pub const REBOOT_GRACE: Duration = Duration::from_secs(1);

/// Executes a reboot request.
pub trait Reboot: Send + Sync {
    /// Returns only when the reboot did not happen. `Ok` means the request
    /// was accepted by an executor that does not take the system down.
    fn reboot(&self, request: &RebootRequest) -> Result<()>;
}

/// Reboots the BMC through `reboot(2)`.
pub struct SystemReboot {
    metrics: Arc<dyn HostMetrics>,
}

impl SystemReboot {
    pub fn new(metrics: Arc<dyn HostMetrics>) -> Self {
        Self { metrics }
    }
}

impl Reboot for SystemReboot {
    fn reboot(&self, request: &RebootRequest) -> Result<()> {
        let uptime = self.metrics.uptime().map(|d| d.as_secs()).unwrap_or(0);
        crate::alarm_event!(
            request.level,
            signal = %request.signal,
            value = request.value,
            threshold = request.threshold,
            "Rebooting BMC; latest uptime: {uptime} sec"
        );
        std::thread::sleep(REBOOT_GRACE);
        restart_system()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn restart_system() -> Result<()> {
    use nix::sys::reboot::{RebootMode, reboot};
    match reboot(RebootMode::RB_AUTOBOOT) {
        Ok(never) => match never {},
        Err(errno) => Err(HealthError::Io(std::io::Error::from(errno))),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn restart_system() -> Result<()> {
    Err(HealthError::Unsupported("reboot"))
}

/// Records requests instead of rebooting.
#[derive(Debug, Default)]
pub struct RecordingReboot {
    requests: Mutex<Vec<RebootRequest>>,
}

impl RecordingReboot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<RebootRequest> {
        self.requests.lock().clone()
    }
}

impl Reboot for RecordingReboot {
    fn reboot(&self, request: &RebootRequest) -> Result<()> {
        tracing::warn!(signal = %request.signal, "reboot requested (recorded only)");
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;

    #[test]
    fn recording_reboot_keeps_requests() {
        let r = RecordingReboot::new();
        let req = RebootRequest {
            signal: "BMC CPU utilization".to_string(),
            value: 97.0,
            threshold: 95.0,
            level: LogLevel::Critical,
        };
        r.reboot(&req).unwrap();
        assert_eq!(r.requests(), vec![req]);
    }
}
