//! Blocks `shutdown`/`halt` while a firmware update is in progress.
//!
//! Toggling the execute bits on the init binaries keeps an operator (or a
//! script) from rebooting the BMC in the middle of flashing a device.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::platform::Platform;
use crate::supervisor::{Monitor, Poll};

/// Binaries whose permissions are toggled.
pub const GUARDED_BINARIES: [&str; 2] = ["/sbin/shutdown.sysvinit", "/sbin/halt.sysvinit"];

/// Mode while an update runs: not executable.
pub const UPDATING_MODE: u32 = 0o666;
/// Normal mode: setuid root executable.
pub const NORMAL_MODE: u32 = 0o4755;

pub const FW_UPDATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Watches the system-wide update flag and toggles the guarded binaries on
/// every change.
pub struct FwUpdateGuard {
    platform: Arc<dyn Platform>,
    binaries: Vec<PathBuf>,
    updating: bool,
}

impl FwUpdateGuard {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::with_binaries(platform, GUARDED_BINARIES)
    }

    pub fn with_binaries(
        platform: Arc<dyn Platform>,
        binaries: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        Self {
            platform,
            binaries: binaries.into_iter().map(Into::into).collect(),
            updating: false,
        }
    }

    fn apply(&self, updating: bool) {
        let mode = if updating { UPDATING_MODE } else { NORMAL_MODE };
        tracing::info!(updating, mode = %format!("{mode:o}"), "firmware update state changed");
        for path in &self.binaries {
            if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
                tracing::warn!(path = %path.display(), error = %err, "failed to change permissions");
            }
        }
    }
}

impl Monitor for FwUpdateGuard {
    fn name(&self) -> &'static str {
        "fw-update"
    }

    fn interval(&self) -> Duration {
        FW_UPDATE_POLL_INTERVAL
    }

    fn poll(&mut self) -> Poll {
        let updating = self.platform.is_fw_update_ongoing_system();
        if updating != self.updating {
            self.apply(updating);
        }
        self.updating = updating;
        Poll::Continue
    }
}
