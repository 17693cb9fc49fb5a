//! Daemon configuration.
//!
//! The file is read as a generic JSON document and each top-level section is
//! deserialized on its own. A malformed section is logged and replaced by its
//! default (which leaves that monitor disabled); it never affects the other
//! sections.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregator::BmcHealthConfig;
use crate::ecc::EccConfig;
use crate::error::{HealthError, Result};
use crate::heartbeat::HeartbeatConfig;
use crate::i2c::I2cConfig;
use crate::nm::NmConfig;
use crate::utilization::UtilizationConfig;
use crate::vboot::VerifiedBootConfig;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/healthd-config.json";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "HEALTHD_CONFIG";

/// Parsed configuration, one field per section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthdConfig {
    pub version: Option<String>,
    pub heartbeat: HeartbeatConfig,
    pub bmc_cpu_utilization: UtilizationConfig,
    pub bmc_mem_utilization: UtilizationConfig,
    pub i2c: I2cConfig,
    pub ecc_monitoring: EccConfig,
    pub bmc_health: BmcHealthConfig,
    pub nm_monitor: NmConfig,
    pub verified_boot: VerifiedBootConfig,
}

impl HealthdConfig {
    /// Build from an already parsed document. Never fails.
    #[must_use]
    pub fn from_value(root: &Value) -> Self {
        let version = root
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(version) = &version {
            tracing::info!(version = %version, "Loaded configuration version: {version}");
        }

        Self {
            version,
            heartbeat: section(root, "heartbeat"),
            bmc_cpu_utilization: section(root, "bmc_cpu_utilization"),
            bmc_mem_utilization: section(root, "bmc_mem_utilization"),
            i2c: section(root, "i2c"),
            ecc_monitoring: section(root, "ecc_monitoring"),
            bmc_health: section(root, "bmc_health"),
            nm_monitor: section(root, "nm_monitor"),
            verified_boot: section(root, "verified_boot"),
        }
    }

    /// Parse a JSON document. Fails only if the document itself is not JSON
    /// or not an object.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)?;
        if !root.is_object() {
            return Err(HealthError::Config(
                "top-level value must be an object".to_string(),
            ));
        }
        Ok(Self::from_value(&root))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Load `path`, or fall back to an all-disabled configuration.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "HEALTHD configuration load failed");
                Self::default()
            }
        }
    }
}

/// Configuration path from `HEALTHD_CONFIG`, or the default.
#[must_use]
pub fn config_path_from_env() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .filter(|p| !p.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

fn section<T: DeserializeOwned + Default>(root: &Value, key: &str) -> T {
    match root.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => T::deserialize(value).unwrap_or_else(|err| {
            tracing::warn!(section = key, error = %err, "ignoring malformed configuration section");
            T::default()
        }),
    }
}
