//! CPU and memory utilization monitors.
//!
//! Both share one loop: sample a busy fraction, push it into a
//! [`MovingAverageWindow`], and once the window is full run the average
//! (in percent) through the signal's [`ThresholdSet`]. Consecutive read
//! failures stop only the affected monitor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HealthError, Result};
use crate::metrics::{CpuTimes, HostMetrics};
use crate::supervisor::{Monitor, Poll};
use crate::threshold::{SignalKind, Threshold, ThresholdConfig, ThresholdSet, thresholds_from_config};
use crate::window::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE, MovingAverageWindow};

/// Consecutive read failures after which a utilization monitor stops.
pub const MAX_READ_FAILURES: u32 = 5;

/// Kernel knob turning OOM into a panic (and therefore a watchdog reboot).
pub const PANIC_ON_OOM_PATH: &str = "/proc/sys/vm/panic_on_oom";

// =============================================================================
// Configuration
// =============================================================================

/// `bmc_cpu_utilization` / `bmc_mem_utilization` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilizationConfig {
    pub enabled: bool,
    pub window_size: usize,
    /// Seconds between samples; values <= 0 fall back to 1.
    pub monitor_interval: i64,
    /// Required; a section without it leaves the monitor disabled.
    pub threshold: Option<Vec<ThresholdConfig>>,
    /// Memory only.
    pub enable_panic_on_oom: bool,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: DEFAULT_WINDOW_SIZE,
            monitor_interval: 1,
            threshold: None,
            enable_panic_on_oom: false,
        }
    }
}

impl UtilizationConfig {
    /// Enabled and carrying a threshold list.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.threshold.is_some()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.monitor_interval).unwrap_or(0).max(1))
    }

    #[must_use]
    pub fn thresholds(&self) -> Vec<Threshold> {
        self.threshold
            .as_deref()
            .map(thresholds_from_config)
            .unwrap_or_default()
    }
}

// =============================================================================
// Samplers
// =============================================================================

/// Produces one busy fraction per call.
pub trait UtilizationSampler: Send {
    /// `Ok(None)` means the source had no new data this round.
    fn sample(&mut self) -> Result<Option<f64>>;

    /// Message logged for a failed read.
    fn failure_message(&self) -> &'static str;
}

/// CPU busy fraction from successive `/proc/stat` snapshots.
///
/// The first sample is measured against an all-zero baseline, i.e. the
/// average since boot.
pub struct CpuSampler {
    metrics: Arc<dyn HostMetrics>,
    prev: CpuTimes,
}

impl CpuSampler {
    pub fn new(metrics: Arc<dyn HostMetrics>) -> Self {
        Self {
            metrics,
            prev: CpuTimes::default(),
        }
    }
}

impl UtilizationSampler for CpuSampler {
    fn sample(&mut self) -> Result<Option<f64>> {
        let now = self.metrics.cpu_times()?;
        let fraction = now.utilization_since(&self.prev);
        self.prev = now;
        Ok(fraction)
    }

    fn failure_message(&self) -> &'static str {
        "Failed to get CPU statistics."
    }
}

/// Memory busy fraction from `sysinfo(2)`.
pub struct MemorySampler {
    metrics: Arc<dyn HostMetrics>,
}

impl MemorySampler {
    pub fn new(metrics: Arc<dyn HostMetrics>) -> Self {
        Self { metrics }
    }
}

impl UtilizationSampler for MemorySampler {
    fn sample(&mut self) -> Result<Option<f64>> {
        let info = self.metrics.memory()?;
        info.utilization().map(Some).ok_or(HealthError::Parse {
            source_name: "sysinfo",
            detail: "total RAM reported as zero".to_string(),
        })
    }

    fn failure_message(&self) -> &'static str {
        "Failed to get sys info."
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Windowed utilization monitor for one signal.
pub struct UtilizationMonitor {
    name: &'static str,
    sampler: Box<dyn UtilizationSampler>,
    window: MovingAverageWindow,
    thresholds: ThresholdSet,
    interval: Duration,
    failures: u32,
    panic_on_oom: Option<PathBuf>,
}

impl UtilizationMonitor {
    /// CPU monitor (`bmc_cpu_utilization`).
    pub fn cpu(
        metrics: Arc<dyn HostMetrics>,
        thresholds: ThresholdSet,
        window_size: usize,
        interval: Duration,
    ) -> Self {
        Self::new("cpu", Box::new(CpuSampler::new(metrics)), thresholds, window_size, interval)
    }

    /// Memory monitor (`bmc_mem_utilization`).
    pub fn memory(
        metrics: Arc<dyn HostMetrics>,
        thresholds: ThresholdSet,
        window_size: usize,
        interval: Duration,
    ) -> Self {
        Self::new("mem", Box::new(MemorySampler::new(metrics)), thresholds, window_size, interval)
    }

    pub fn new(
        name: &'static str,
        sampler: Box<dyn UtilizationSampler>,
        thresholds: ThresholdSet,
        window_size: usize,
        interval: Duration,
    ) -> Self {
        if window_size > MAX_WINDOW_SIZE {
            tracing::warn!(
                monitor = name,
                window_size,
                max = MAX_WINDOW_SIZE,
                "window_size too large; capping"
            );
        }
        Self {
            name,
            sampler,
            window: MovingAverageWindow::new(window_size),
            thresholds,
            interval,
            failures: 0,
            panic_on_oom: None,
        }
    }

    /// Make sure `panic_on_oom` is enabled (via the knob at `path`) before
    /// the first sample.
    #[must_use]
    pub fn with_panic_on_oom(mut self, path: impl Into<PathBuf>) -> Self {
        self.panic_on_oom = Some(path.into());
        self
    }

    #[must_use]
    pub fn signal(&self) -> SignalKind {
        self.thresholds.kind()
    }

    #[must_use]
    pub fn window(&self) -> &MovingAverageWindow {
        &self.window
    }

    #[must_use]
    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }
}

impl Monitor for UtilizationMonitor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn start(&mut self) {
        if let Some(path) = &self.panic_on_oom {
            if let Err(err) = enable_panic_on_oom(path) {
                tracing::error!(path = %path.display(), error = %err, "failed to enable panic_on_oom");
            }
        }
    }

    fn poll(&mut self) -> Poll {
        let fraction = match self.sampler.sample() {
            Ok(fraction) => {
                self.failures = 0;
                fraction
            }
            Err(err) => {
                self.failures += 1;
                tracing::warn!(
                    monitor = self.name,
                    failures = self.failures,
                    error = %err,
                    "{}",
                    self.sampler.failure_message()
                );
                if self.failures >= MAX_READ_FAILURES {
                    tracing::error!(
                        monitor = self.name,
                        signal = %self.thresholds.name(),
                        "Cannot read {} statistics. Stop the {} monitor",
                        self.thresholds.name(),
                        self.name
                    );
                    return Poll::Stop;
                }
                return Poll::Continue;
            }
        };

        let Some(fraction) = fraction else {
            return Poll::Continue;
        };
        let Some(average) = self.window.push(fraction) else {
            return Poll::Continue;
        };
        tracing::trace!(monitor = self.name, average, "utilization average");
        match self.thresholds.check(average).reboot {
            Some(request) => Poll::Reboot(request),
            None => Poll::Continue,
        }
    }
}

/// Set the `panic_on_oom` knob to 1 if it currently reads 0.
///
/// Returns whether the file was written.
pub fn enable_panic_on_oom(path: &std::path::Path) -> Result<bool> {
    let current = std::fs::read_to_string(path)?;
    let value: i64 = current.trim().parse().map_err(|_| HealthError::Parse {
        source_name: "panic_on_oom",
        detail: format!("unexpected contents {:?}", current.trim()),
    })?;
    if value != 0 {
        return Ok(false);
    }
    std::fs::write(path, "1")?;
    tracing::info!(path = %path.display(), "enabled panic_on_oom");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::HealthAggregator;
    use crate::kv::MemoryKvStore;
    use crate::logging::test_support::capture_logs;
    use crate::metrics::MemoryInfo;
    use crate::platform::RecordingPlatform;
    use crate::threshold::{Threshold, ThresholdAction};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedMetrics {
        cpu: Mutex<VecDeque<Result<CpuTimes>>>,
        mem: Mutex<VecDeque<Result<MemoryInfo>>>,
    }

    impl HostMetrics for ScriptedMetrics {
        fn cpu_times(&self) -> Result<CpuTimes> {
            self.cpu
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(HealthError::Unsupported("exhausted")))
        }

        fn memory(&self) -> Result<MemoryInfo> {
            self.mem
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(HealthError::Unsupported("exhausted")))
        }

        fn uptime(&self) -> Result<Duration> {
            Ok(Duration::from_secs(42))
        }
    }

    fn thresholds(kind: SignalKind, t: Threshold) -> ThresholdSet {
        let kv = Arc::new(MemoryKvStore::new());
        ThresholdSet::new(
            kind,
            vec![t],
            Arc::new(HealthAggregator::new(kv)),
            Arc::new(RecordingPlatform::new()),
        )
    }

    #[test]
    fn config_defaults_and_interval_floor() {
        let c: UtilizationConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert_eq!(c.window_size, 120);
        assert!(!c.is_active());
        assert_eq!(c.interval(), Duration::from_secs(1));

        let c: UtilizationConfig = serde_json::from_str(
            r#"{"enabled": true, "monitor_interval": -4, "threshold": [{"value": 70.0}]}"#,
        )
        .unwrap();
        assert!(c.is_active());
        assert_eq!(c.interval(), Duration::from_secs(1));
        assert_eq!(c.thresholds().len(), 1);
    }

    #[test]
    fn huge_window_size_is_capped_with_warning() {
        let c: UtilizationConfig = serde_json::from_str(
            r#"{"enabled": true, "window_size": 1000000000000, "threshold": [{"value": 80.0}]}"#,
        )
        .unwrap();
        let (m, logs) = capture_logs(|| {
            UtilizationMonitor::cpu(
                Arc::new(ScriptedMetrics::default()),
                thresholds(SignalKind::CpuUtilization, Threshold::new(80.0)),
                c.window_size,
                c.interval(),
            )
        });
        assert_eq!(m.window().capacity(), MAX_WINDOW_SIZE);
        assert_eq!(logs.count("window_size too large; capping"), 1);
    }

    #[test]
    fn memory_asserts_after_window_fills() {
        let metrics = Arc::new(ScriptedMetrics::default());
        for _ in 0..4 {
            metrics.mem.lock().push_back(Ok(MemoryInfo {
                total: 100,
                free: 10,
            }));
        }
        let mut m = UtilizationMonitor::memory(
            metrics,
            thresholds(
                SignalKind::MemoryUtilization,
                Threshold::new(80.0).with_action(ThresholdAction::LogWarning),
            ),
            4,
            Duration::ZERO,
        );
        let ((), logs) = capture_logs(|| {
            for _ in 0..4 {
                assert!(matches!(m.poll(), Poll::Continue));
            }
        });
        assert_eq!(logs.count(" ASSERT: BMC Memory utilization (90.00%)"), 1);
        assert!(m.thresholds().thresholds()[0].is_asserted());
    }

    #[test]
    fn stops_after_consecutive_failures() {
        let metrics = Arc::new(ScriptedMetrics::default());
        let mut m = UtilizationMonitor::cpu(
            metrics.clone(),
            thresholds(SignalKind::CpuUtilization, Threshold::new(80.0)),
            2,
            Duration::ZERO,
        );
        for _ in 0..MAX_READ_FAILURES - 1 {
            assert!(matches!(m.poll(), Poll::Continue));
        }
        assert!(matches!(m.poll(), Poll::Stop));
    }

    #[test]
    fn success_resets_failure_count() {
        let metrics = Arc::new(ScriptedMetrics::default());
        {
            let mut cpu = metrics.cpu.lock();
            for _ in 0..4 {
                cpu.push_back(Err(HealthError::Unsupported("flaky")));
            }
            cpu.push_back(Ok(CpuTimes {
                user: 10,
                idle: 10,
                ..CpuTimes::default()
            }));
            for _ in 0..4 {
                cpu.push_back(Err(HealthError::Unsupported("flaky")));
            }
        }
        let mut m = UtilizationMonitor::cpu(
            metrics,
            thresholds(SignalKind::CpuUtilization, Threshold::new(80.0)),
            2,
            Duration::ZERO,
        );
        for _ in 0..9 {
            assert!(matches!(m.poll(), Poll::Continue));
        }
        assert!(matches!(m.poll(), Poll::Stop));
    }

    #[test]
    fn cpu_without_new_jiffies_pushes_nothing() {
        let metrics = Arc::new(ScriptedMetrics::default());
        let t = CpuTimes {
            user: 50,
            idle: 50,
            ..CpuTimes::default()
        };
        metrics.cpu.lock().extend([Ok(t), Ok(t), Ok(t)]);
        let mut m = UtilizationMonitor::cpu(
            metrics,
            thresholds(SignalKind::CpuUtilization, Threshold::new(80.0)),
            3,
            Duration::ZERO,
        );
        for _ in 0..3 {
            m.poll();
        }
        assert_eq!(m.window().total_pushed(), 1);
    }

    #[test]
    fn reboot_action_surfaces_as_poll() {
        let metrics = Arc::new(ScriptedMetrics::default());
        metrics.mem.lock().push_back(Ok(MemoryInfo { total: 10, free: 0 }));
        let mut m = UtilizationMonitor::memory(
            metrics,
            thresholds(
                SignalKind::MemoryUtilization,
                Threshold::new(90.0).with_action(ThresholdAction::Reboot),
            ),
            1,
            Duration::ZERO,
        );
        match m.poll() {
            Poll::Reboot(req) => assert_eq!(req.signal, "BMC Memory utilization"),
            _ => panic!("expected reboot"),
        }
    }

    #[test]
    fn panic_on_oom_written_only_when_zero() {
        let dir = tempfile::tempdir().unwrap();
        let knob = dir.path().join("panic_on_oom");
        std::fs::write(&knob, "0\n").unwrap();
        assert!(enable_panic_on_oom(&knob).unwrap());
        assert_eq!(std::fs::read_to_string(&knob).unwrap(), "1");
        assert!(!enable_panic_on_oom(&knob).unwrap());

        std::fs::write(&knob, "2\n").unwrap();
        assert!(!enable_panic_on_oom(&knob).unwrap());
        assert_eq!(std::fs::read_to_string(&knob).unwrap(), "2\n");
    }

    #[test]
    fn panic_on_oom_failure_does_not_stop_monitor() {
        let metrics = Arc::new(ScriptedMetrics::default());
        metrics.mem.lock().push_back(Ok(MemoryInfo { total: 10, free: 5 }));
        let mut m = UtilizationMonitor::memory(
            metrics,
            thresholds(SignalKind::MemoryUtilization, Threshold::new(80.0)),
            1,
            Duration::ZERO,
        )
        .with_panic_on_oom("/nonexistent/healthd/panic_on_oom");
        let ((), logs) = capture_logs(|| m.start());
        assert_eq!(logs.count("failed to enable panic_on_oom"), 1);
        assert!(matches!(m.poll(), Poll::Continue));
    }
}
