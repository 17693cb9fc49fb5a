//! Host CPU and memory statistics.
//!
//! - CPU: aggregate `cpu` line of `/proc/stat`, in jiffies.
//! - Memory and uptime: `sysinfo(2)`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HealthError, Result};

/// Path of the kernel CPU statistics file.
pub const PROC_STAT_PATH: &str = "/proc/stat";

// =============================================================================
// CPU times
// =============================================================================

/// Cumulative CPU time counters for all CPUs.
///
/// `guest` and `guest_nice` are already included in `user` and `nice`, so they
/// are parsed but never summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    /// Parse the aggregate `cpu` line from the contents of `/proc/stat`.
    pub fn parse_proc_stat(contents: &str) -> Result<Self> {
        let line = contents
            .lines()
            .find(|l| l.split_whitespace().next() == Some("cpu"))
            .ok_or_else(|| HealthError::Parse {
                source_name: "/proc/stat",
                detail: "no aggregate cpu line".to_string(),
            })?;

        let fields = line
            .split_whitespace()
            .skip(1)
            .map(str::parse::<u64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HealthError::Parse {
                source_name: "/proc/stat",
                detail: e.to_string(),
            })?;
        if fields.len() < 4 {
            return Err(HealthError::Parse {
                source_name: "/proc/stat",
                detail: format!("expected at least 4 cpu fields, got {}", fields.len()),
            });
        }
        let field = |i: usize| fields.get(i).copied().unwrap_or(0);

        Ok(Self {
            user: field(0),
            nice: field(1),
            system: field(2),
            idle: field(3),
            iowait: field(4),
            irq: field(5),
            softirq: field(6),
            steal: field(7),
            guest: field(8),
            guest_nice: field(9),
        })
    }

    /// Idle jiffies (idle + iowait).
    #[must_use]
    pub fn idle_total(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// Busy jiffies (user + nice + system + irq + softirq + steal).
    #[must_use]
    pub fn non_idle_total(&self) -> u64 {
        [
            self.user,
            self.nice,
            self.system,
            self.irq,
            self.softirq,
            self.steal,
        ]
        .iter()
        .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.idle_total().saturating_add(self.non_idle_total())
    }

    /// Busy fraction between `prev` and `self`.
    ///
    /// `None` when no jiffies elapsed (or the counters went backwards).
    #[must_use]
    pub fn utilization_since(&self, prev: &Self) -> Option<f64> {
        let total_delta = self.total().checked_sub(prev.total())?;
        if total_delta == 0 {
            return None;
        }
        let idle_delta = self.idle_total().saturating_sub(prev.idle_total());
        let busy = total_delta.saturating_sub(idle_delta);
        Some(busy as f64 / total_delta as f64)
    }
}

// =============================================================================
// Memory
// =============================================================================

/// RAM snapshot in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
}

impl MemoryInfo {
    /// `(total - free) / total`, or `None` when total is zero.
    #[must_use]
    pub fn utilization(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.total.saturating_sub(self.free) as f64 / self.total as f64)
    }
}

// =============================================================================
// HostMetrics
// =============================================================================

/// Source of host statistics for the utilization monitors.
pub trait HostMetrics: Send + Sync {
    fn cpu_times(&self) -> Result<CpuTimes>;

    fn memory(&self) -> Result<MemoryInfo>;

    /// Time since boot.
    fn uptime(&self) -> Result<Duration>;
}

/// [`HostMetrics`] backed by procfs and `sysinfo(2)`.
#[derive(Debug, Clone)]
pub struct ProcfsMetrics {
    stat_path: PathBuf,
}

impl ProcfsMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stat_path: PathBuf::from(PROC_STAT_PATH),
        }
    }

    /// Read CPU statistics from another file (tests, chroots).
    #[must_use]
    pub fn with_stat_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stat_path = path.into();
        self
    }
}

impl Default for ProcfsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for ProcfsMetrics {
    fn cpu_times(&self) -> Result<CpuTimes> {
        let contents = std::fs::read_to_string(&self.stat_path)?;
        CpuTimes::parse_proc_stat(&contents)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn memory(&self) -> Result<MemoryInfo> {
        let info = nix::sys::sysinfo::sysinfo().map_err(std::io::Error::from)?;
        Ok(MemoryInfo {
            total: info.ram_total(),
            free: info.ram_unused(),
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn memory(&self) -> Result<MemoryInfo> {
        Err(HealthError::Unsupported("sysinfo"))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn uptime(&self) -> Result<Duration> {
        let info = nix::sys::sysinfo::sysinfo().map_err(std::io::Error::from)?;
        Ok(info.uptime())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn uptime(&self) -> Result<Duration> {
        Err(HealthError::Unsupported("sysinfo"))
    }
}
