//! I2C bus-fault monitor.
//!
//! The controller driver reports a status word per bus describing the
//! outcome of its bus-recovery attempts:
//!
//! | bit | meaning |
//! |-----|---------|
//! | 0 | bus lock, recovery error |
//! | 1 | bus lock, recovery timed out |
//! | 2 | bus lock, recovered |
//! | 3 | bus lock, reserved |
//! | 4 | slave dead, recovery error |
//! | 5 | slave dead, recovery timed out |
//! | 6 | slave dead, recovered |
//! | 7 | slave dead, reserved |
//!
//! Anything left after the six defined flags (reserved bits included) is an
//! undefined condition. Fault conditions latch per bus until the status word
//! reads zero again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::supervisor::{Monitor, Poll};

/// Number of I2C buses on the controller.
pub const I2C_BUS_COUNT: u8 = 14;

/// Polling cadence of the bus monitor.
pub const I2C_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Latch bit used for undefined status bits.
const UNDEFINED_LATCH_BIT: u32 = 8;

// =============================================================================
// Conditions
// =============================================================================

/// Decoded sub-condition of a bus status word, in decode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum I2cCondition {
    LockRecoverError,
    LockRecoverTimeout,
    LockRecoverSuccess,
    SlaveDeadError,
    SlaveDeadTimeout,
    SlaveDeadSuccess,
    Undefined,
}

impl I2cCondition {
    /// The defined flags, in decode order.
    pub const DEFINED: [Self; 6] = [
        Self::LockRecoverError,
        Self::LockRecoverTimeout,
        Self::LockRecoverSuccess,
        Self::SlaveDeadError,
        Self::SlaveDeadTimeout,
        Self::SlaveDeadSuccess,
    ];

    /// Status-word bit, `None` for [`Self::Undefined`].
    #[must_use]
    pub const fn status_bit(self) -> Option<u32> {
        match self {
            Self::LockRecoverError => Some(0),
            Self::LockRecoverTimeout => Some(1),
            Self::LockRecoverSuccess => Some(2),
            Self::SlaveDeadError => Some(4),
            Self::SlaveDeadTimeout => Some(5),
            Self::SlaveDeadSuccess => Some(6),
            Self::Undefined => None,
        }
    }

    /// Latch bit, `None` for success flags which never latch.
    #[must_use]
    pub const fn latch_bit(self) -> Option<u32> {
        match self {
            Self::LockRecoverSuccess | Self::SlaveDeadSuccess => None,
            Self::Undefined => Some(UNDEFINED_LATCH_BIT),
            other => other.status_bit(),
        }
    }

    /// Log line for this condition on `bus`.
    #[must_use]
    pub fn message(self, bus: u8) -> String {
        match self {
            Self::LockRecoverError => format!(
                "ASSERT: I2C({bus}) bus is locked (Master Lock or Slave Clock Stretch). Recovery error. (I2C bus index base 0)"
            ),
            Self::LockRecoverTimeout => format!(
                "ASSERT: I2C({bus}) bus is locked (Master Lock or Slave Clock Stretch). Recovery timed out. (I2C bus index base 0)"
            ),
            Self::LockRecoverSuccess => format!(
                "I2C({bus}) bus had been locked (Master Lock or Slave Clock Stretch) and has been recoveried successfully. (I2C bus index base 0)"
            ),
            Self::SlaveDeadError => format!(
                "ASSERT: I2C({bus}) Slave is dead (SDA keeps low). Bus recovery error. (I2C bus index base 0)"
            ),
            Self::SlaveDeadTimeout => format!(
                "ASSERT: I2C({bus}) Slave is dead (SDAs keep low). Bus recovery timed out. (I2C bus index base 0)"
            ),
            Self::SlaveDeadSuccess => format!(
                "I2C({bus}) Slave was dead. and bus has been recoveried successfully. (I2C bus index base 0)"
            ),
            Self::Undefined => {
                format!("ASSERT: I2C({bus}) Undefined case. (I2C bus index base 0)")
            }
        }
    }
}

/// Line logged when a faulty bus reads clear again.
#[must_use]
pub fn recovered_message(bus: u8) -> String {
    format!("DEASSERT: I2C({bus}) Bus recoveried. (I2C bus index base 0)")
}

// =============================================================================
// Latch + decoder
// =============================================================================

/// What one status word produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cEvent {
    /// A fault condition newly latched.
    Assert(I2cCondition),
    /// A recovery-success flag (logged every time it is seen).
    Success(I2cCondition),
    /// The bus read clear after a fault.
    Recovered,
}

/// Result of decoding one status word.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusDecode {
    pub events: Vec<I2cEvent>,
    /// Send a crash-assert notification.
    pub crash_assert: bool,
    /// Send a crash-deassert notification.
    pub crash_deassert: bool,
}

/// Per-bus latch of reported fault conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusFaultLatch {
    bits: u32,
}

impl BusFaultLatch {
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    #[must_use]
    pub fn is_latched(&self, condition: I2cCondition) -> bool {
        condition
            .latch_bit()
            .is_some_and(|bit| self.bits & (1 << bit) != 0)
    }

    /// Fold one status word into the latch.
    pub fn decode(&mut self, status: u32) -> BusDecode {
        let mut out = BusDecode::default();
        if status == 0 {
            if self.bits != 0 {
                self.bits = 0;
                out.events.push(I2cEvent::Recovered);
                out.crash_deassert = true;
            }
            return out;
        }

        let mut remaining = status;
        for condition in I2cCondition::DEFINED {
            let Some(bit) = condition.status_bit() else {
                continue;
            };
            let present = remaining & (1 << bit) != 0;
            remaining &= !(1 << bit);
            if !present {
                continue;
            }
            match condition.latch_bit() {
                None => out.events.push(I2cEvent::Success(condition)),
                Some(latch) if self.bits & (1 << latch) == 0 => {
                    self.bits |= 1 << latch;
                    out.events.push(I2cEvent::Assert(condition));
                    out.crash_assert = true;
                }
                Some(_) => {}
            }
        }

        if remaining != 0 && !self.is_latched(I2cCondition::Undefined) {
            self.bits |= 1 << UNDEFINED_LATCH_BIT;
            out.events.push(I2cEvent::Assert(I2cCondition::Undefined));
            out.crash_assert = true;
        }
        out
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// `i2c` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cConfig {
    pub enabled: bool,
    /// Required and non-empty for the monitor to run.
    pub busses: Option<Vec<i64>>,
}

impl I2cConfig {
    /// Valid bus indices. Out-of-range entries are dropped with a log line.
    #[must_use]
    pub fn buses(&self) -> Vec<u8> {
        let mut buses = Vec::new();
        for &bus in self.busses.iter().flatten() {
            match u8::try_from(bus) {
                Ok(index) if index < I2C_BUS_COUNT => {
                    if !buses.contains(&index) {
                        buses.push(index);
                    }
                }
                _ => tracing::error!(bus, "HEALTHD: Warning: Ignoring unsupported I2C Bus:{bus}"),
            }
        }
        buses.sort_unstable();
        buses
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.busses.as_ref().is_some_and(|b| !b.is_empty())
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Polls every enabled bus through the platform.
pub struct I2cMonitor {
    platform: Arc<dyn Platform>,
    buses: Vec<u8>,
    latches: [BusFaultLatch; I2C_BUS_COUNT as usize],
    interval: Duration,
}

impl I2cMonitor {
    /// Buses at or above [`I2C_BUS_COUNT`] are skipped with a log line.
    pub fn new(platform: Arc<dyn Platform>, buses: Vec<u8>) -> Self {
        let (buses, unsupported): (Vec<u8>, Vec<u8>) =
            buses.into_iter().partition(|b| *b < I2C_BUS_COUNT);
        for bus in unsupported {
            tracing::warn!(bus, "skipping unsupported I2C bus {bus}");
        }
        Self {
            platform,
            buses,
            latches: [BusFaultLatch::default(); I2C_BUS_COUNT as usize],
            interval: I2C_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Latch state of `bus`, `None` for an unsupported bus number.
    #[must_use]
    pub fn latch(&self, bus: u8) -> Option<BusFaultLatch> {
        self.latches.get(usize::from(bus)).copied()
    }

    fn poll_bus(&mut self, bus: u8) {
        let status = match self.platform.i2c_bus_status(bus) {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(bus, error = %err, "I2C bus status query failed");
                return;
            }
        };

        let Some(latch) = self.latches.get_mut(usize::from(bus)) else {
            return;
        };
        let decode = latch.decode(status);
        for event in &decode.events {
            match event {
                I2cEvent::Assert(c) | I2cEvent::Success(c) => {
                    tracing::error!(bus, status, "{}", c.message(bus));
                }
                I2cEvent::Recovered => tracing::error!(bus, "{}", recovered_message(bus)),
            }
        }
        if decode.crash_assert {
            self.platform.i2c_crash_assert(bus);
        }
        if decode.crash_deassert {
            self.platform.i2c_crash_deassert(bus);
        }
    }
}

impl Monitor for I2cMonitor {
    fn name(&self) -> &'static str {
        "i2c"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn poll(&mut self) -> Poll {
        for i in 0..self.buses.len() {
            let bus = self.buses[i];
            self.poll_bus(bus);
        }
        Poll::Continue
    }
}
