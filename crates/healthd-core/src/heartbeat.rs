//! Heartbeat LED and hardware watchdog loops.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::supervisor::{Monitor, Poll};

/// Period between watchdog kicks.
pub const WATCHDOG_KICK_INTERVAL: Duration = Duration::from_secs(5);

/// `heartbeat` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Half-period of the blink, in milliseconds. 0 is treated as 1.
    pub interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: 500 }
    }
}

/// Blinks the heartbeat LED: on for one interval, off for the next.
pub struct HeartbeatMonitor {
    platform: Arc<dyn Platform>,
    interval: Duration,
    led_on: bool,
}

impl HeartbeatMonitor {
    pub fn new(platform: Arc<dyn Platform>, config: &HeartbeatConfig) -> Self {
        Self {
            platform,
            interval: Duration::from_millis(config.interval.max(1)),
            led_on: false,
        }
    }
}

impl Monitor for HeartbeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn poll(&mut self) -> Poll {
        self.led_on = !self.led_on;
        if let Err(err) = self.platform.set_heartbeat_led(self.led_on) {
            tracing::debug!(error = %err, on = self.led_on, "heartbeat LED update failed");
        }
        Poll::Continue
    }
}

/// Keeps the hardware watchdog from expiring while the daemon is alive.
pub struct WatchdogMonitor {
    platform: Arc<dyn Platform>,
}

impl WatchdogMonitor {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

impl Monitor for WatchdogMonitor {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    fn interval(&self) -> Duration {
        WATCHDOG_KICK_INTERVAL
    }

    fn poll(&mut self) -> Poll {
        if let Err(err) = self.platform.kick_watchdog() {
            tracing::debug!(error = %err, "watchdog kick failed");
        }
        Poll::Continue
    }
}
