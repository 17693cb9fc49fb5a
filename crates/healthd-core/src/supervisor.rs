//! Thread-per-monitor scheduling.
//!
//! Every enabled monitor gets a dedicated named thread (`healthd-<name>`)
//! running [`run_monitor`]. Monitors own all of their state; the only shared
//! pieces are the [`HealthAggregator`] and the collaborators behind `Arc`.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::aggregator::{BmcHealthReconciler, HealthAggregator};
use crate::config::HealthdConfig;
use crate::ecc::EccMonitor;
use crate::error::{HealthError, Result};
use crate::fw_update::FwUpdateGuard;
use crate::heartbeat::{HeartbeatMonitor, WatchdogMonitor};
use crate::i2c::I2cMonitor;
use crate::kv::KvStore;
use crate::metrics::HostMetrics;
use crate::nm::NmMonitor;
use crate::platform::Platform;
use crate::reboot::Reboot;
use crate::registers::PhysicalMemory;
use crate::threshold::{RebootRequest, SignalKind, ThresholdSet};
use crate::utilization::{PANIC_ON_OOM_PATH, UtilizationConfig, UtilizationMonitor};
use crate::vboot::{LogHistory, VbootOutcome, check_vboot_state};

/// What a monitor wants after one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    /// Sleep for the monitor's interval.
    Continue,
    /// Sleep for the given delay instead.
    RetryAfter(Duration),
    /// Exit the monitor thread. Other monitors keep running.
    Stop,
    /// Hand the request to the reboot executor. The thread exits once the
    /// executor accepts it; a failed reboot keeps the monitor polling.
    Reboot(RebootRequest),
}

/// A periodic health check driven by its own thread.
pub trait Monitor: Send {
    /// Short name; the thread is called `healthd-<name>`.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One-time setup on the monitor thread.
    fn start(&mut self) {}

    fn poll(&mut self) -> Poll;
}

/// Drive `monitor` until it stops or a reboot request is accepted.
pub fn run_monitor(monitor: &mut dyn Monitor, reboot: &dyn Reboot) {
    tracing::debug!(monitor = monitor.name(), interval_ms = monitor.interval().as_millis(), "monitor started");
    monitor.start();
    loop {
        match monitor.poll() {
            Poll::Continue => std::thread::sleep(monitor.interval()),
            Poll::RetryAfter(delay) => std::thread::sleep(delay),
            Poll::Stop => {
                tracing::info!(monitor = monitor.name(), "monitor stopped");
                return;
            }
            Poll::Reboot(request) => match reboot.reboot(&request) {
                Ok(()) => return,
                Err(err) => {
                    tracing::error!(
                        monitor = monitor.name(),
                        signal = %request.signal,
                        error = %err,
                        "reboot failed; monitor keeps running"
                    );
                    std::thread::sleep(monitor.interval());
                }
            },
        }
    }
}

/// Collaborators shared by the monitors.
#[derive(Clone)]
pub struct Dependencies {
    pub kv: Arc<dyn KvStore>,
    pub platform: Arc<dyn Platform>,
    pub metrics: Arc<dyn HostMetrics>,
    pub memory: Arc<dyn PhysicalMemory>,
    pub reboot: Arc<dyn Reboot>,
    pub log_history: Arc<dyn LogHistory>,
}

/// The set of monitors built from one configuration.
pub struct Supervisor {
    monitors: Vec<Box<dyn Monitor>>,
    aggregator: Arc<HealthAggregator>,
    deps: Dependencies,
    verified_boot: bool,
}

impl Supervisor {
    /// Build every enabled monitor. The heartbeat, watchdog, and firmware
    /// update guard are always present.
    pub fn from_config(config: &HealthdConfig, deps: Dependencies) -> Self {
        let aggregator = Arc::new(HealthAggregator::new(deps.kv.clone()));
        let mut monitors: Vec<Box<dyn Monitor>> = vec![
            Box::new(HeartbeatMonitor::new(deps.platform.clone(), &config.heartbeat)),
            Box::new(WatchdogMonitor::new(deps.platform.clone())),
            Box::new(FwUpdateGuard::new(deps.platform.clone())),
        ];

        let cpu = &config.bmc_cpu_utilization;
        if cpu.is_active() {
            let set = utilization_set(SignalKind::CpuUtilization, cpu, &aggregator, &deps);
            monitors.push(Box::new(UtilizationMonitor::cpu(
                deps.metrics.clone(),
                set,
                cpu.window_size,
                cpu.interval(),
            )));
        }

        let mem = &config.bmc_mem_utilization;
        if mem.is_active() {
            let set = utilization_set(SignalKind::MemoryUtilization, mem, &aggregator, &deps);
            let mut monitor =
                UtilizationMonitor::memory(deps.metrics.clone(), set, mem.window_size, mem.interval());
            if mem.enable_panic_on_oom {
                monitor = monitor.with_panic_on_oom(PANIC_ON_OOM_PATH);
            }
            monitors.push(Box::new(monitor));
        }

        if config.i2c.is_active() {
            monitors.push(Box::new(I2cMonitor::new(deps.platform.clone(), config.i2c.buses())));
        }

        if config.ecc_monitoring.enabled {
            monitors.push(Box::new(EccMonitor::new(
                deps.memory.clone(),
                &config.ecc_monitoring,
                aggregator.clone(),
                deps.platform.clone(),
            )));
        }

        if config.bmc_health.enabled {
            monitors.push(Box::new(BmcHealthReconciler::new(
                aggregator.clone(),
                config.bmc_health.interval_secs(),
                config.bmc_health.regenerating_interval,
            )));
        }

        if config.nm_monitor.enabled {
            monitors.push(Box::new(NmMonitor::new(deps.platform.clone(), &config.nm_monitor)));
        }

        Self {
            monitors,
            aggregator,
            deps,
            verified_boot: config.verified_boot.enabled,
        }
    }

    /// Build from an explicit monitor list.
    pub fn with_monitors(monitors: Vec<Box<dyn Monitor>>, deps: Dependencies) -> Self {
        Self {
            monitors,
            aggregator: Arc::new(HealthAggregator::new(deps.kv.clone())),
            deps,
            verified_boot: false,
        }
    }

    /// Names of the monitors that will be started.
    pub fn monitor_names(&self) -> Vec<&'static str> {
        self.monitors.iter().map(|m| m.name()).collect()
    }

    pub fn aggregator(&self) -> &Arc<HealthAggregator> {
        &self.aggregator
    }

    /// Synchronous startup check, if enabled.
    pub fn check_verified_boot(&self) -> Option<VbootOutcome> {
        if !self.verified_boot {
            return None;
        }
        check_vboot_state(
            self.deps.memory.as_ref(),
            self.deps.kv.as_ref(),
            self.deps.log_history.as_ref(),
        )
    }

    /// Start one thread per monitor.
    ///
    /// If a spawn fails, the threads already started are left running and the
    /// error is returned.
    pub fn spawn(self) -> Result<Vec<JoinHandle<()>>> {
        self.check_verified_boot();
        let mut handles = Vec::with_capacity(self.monitors.len());
        for mut monitor in self.monitors {
            let name = monitor.name();
            let reboot = self.deps.reboot.clone();
            let handle = std::thread::Builder::new()
                .name(format!("healthd-{name}"))
                .spawn(move || run_monitor(monitor.as_mut(), reboot.as_ref()))
                .map_err(|source| HealthError::Spawn {
                    name: name.to_string(),
                    source,
                })?;
            handles.push(handle);
        }
        tracing::info!(monitors = handles.len(), "healthd monitors started");
        Ok(handles)
    }

    /// Spawn all monitors and wait for them. Returns once every monitor
    /// thread has exited.
    pub fn run(self) -> Result<()> {
        for handle in self.spawn()? {
            let name = handle.thread().name().unwrap_or("healthd").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "monitor thread panicked");
            }
        }
        Ok(())
    }
}

fn utilization_set(
    kind: SignalKind,
    config: &UtilizationConfig,
    aggregator: &Arc<HealthAggregator>,
    deps: &Dependencies,
) -> ThresholdSet {
    ThresholdSet::new(
        kind,
        config.thresholds(),
        aggregator.clone(),
        deps.platform.clone(),
    )
}
