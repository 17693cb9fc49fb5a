//! healthd - BMC health monitoring daemon
//!
//! Takes no arguments. Runtime knobs come from the environment:
//!
//! - `HEALTHD_CONFIG`: configuration file (default `/etc/healthd-config.json`)
//! - `HEALTHD_LOG`, `HEALTHD_LOG_FORMAT`, `HEALTHD_LOG_FILE`: logging
//! - `HEALTHD_KV_DIR`: persistent key-value store directory
//! - `HEALTHD_HEARTBEAT_LED`: sysfs `brightness` file of the heartbeat LED

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use healthd_core::config::{HealthdConfig, config_path_from_env};
use healthd_core::kv::{DEFAULT_KV_DIR, FileKvStore, set_default_key_values};
use healthd_core::logging::{LogConfig, LogFormat, init_logging};
use healthd_core::metrics::{HostMetrics, ProcfsMetrics};
use healthd_core::platform::GenericPlatform;
use healthd_core::reboot::SystemReboot;
use healthd_core::registers::DevMem;
use healthd_core::vboot::FileLogHistory;
use healthd_core::{Dependencies, HealthError, Supervisor};

/// healthd takes no arguments.
#[derive(Parser, Debug)]
#[command(
    name = "healthd",
    version,
    about = "BMC health monitoring daemon",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {}

fn log_config_from_env() -> LogConfig {
    let mut config = LogConfig::default();
    if let Ok(level) = std::env::var("HEALTHD_LOG") {
        config.level = level;
    }
    if let Ok(format) = std::env::var("HEALTHD_LOG_FORMAT") {
        match format.parse::<LogFormat>() {
            Ok(format) => config.format = format,
            Err(err) => eprintln!("healthd: {err}; using {}", config.format),
        }
    }
    config.file = std::env::var_os("HEALTHD_LOG_FILE").map(PathBuf::from);
    config
}

fn run() -> anyhow::Result<()> {
    init_logging(&log_config_from_env()).context("failed to initialize logging")?;
    tracing::info!(version = healthd_core::VERSION, "healthd starting");

    let kv_dir = std::env::var_os("HEALTHD_KV_DIR").map_or_else(|| PathBuf::from(DEFAULT_KV_DIR), PathBuf::from);
    let kv = Arc::new(FileKvStore::new(kv_dir));
    if let Err(err) = set_default_key_values(kv.as_ref()) {
        tracing::error!(error = %err, "failed to seed default kv values");
    }

    let config = HealthdConfig::load_or_default(&config_path_from_env());

    let mut platform = GenericPlatform::new();
    if let Some(led) = std::env::var_os("HEALTHD_HEARTBEAT_LED") {
        platform = platform.with_heartbeat_led(led);
    }
    let metrics: Arc<dyn HostMetrics> = Arc::new(ProcfsMetrics::new());

    let deps = Dependencies {
        kv,
        platform: Arc::new(platform),
        metrics: metrics.clone(),
        memory: Arc::new(DevMem::new()),
        reboot: Arc::new(SystemReboot::new(metrics)),
        log_history: Arc::new(FileLogHistory::default()),
    };

    Supervisor::from_config(&config, deps)
        .run()
        .map_err(|err: HealthError| {
            if let Some(remediation) = err.remediation() {
                eprint!("{}", remediation.render_plain());
            }
            anyhow::Error::new(err)
        })
        .context("healthd supervisor failed")
}

fn main() -> ExitCode {
    if let Err(err) = Cli::try_parse() {
        eprintln!("{err}");
        eprintln!("Usage: healthd");
        return ExitCode::from(1);
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("healthd: {err:#}");
            ExitCode::from(1)
        }
    }
}
