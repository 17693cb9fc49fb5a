#![no_main]

use healthd_core::config::HealthdConfig;
use healthd_core::i2c::I2C_BUS_COUNT;
use healthd_core::threshold::{MAX_UTILIZATION_THRESHOLD, MIN_UTILIZATION_THRESHOLD};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = HealthdConfig::from_json_str(text) else {
        return;
    };

    assert!(config.i2c.buses().iter().all(|b| *b < I2C_BUS_COUNT));
    assert!(config.bmc_cpu_utilization.interval().as_secs() >= 1);
    assert!(config.nm_monitor.interval().as_secs() >= 1);

    for mut t in config.bmc_cpu_utilization.thresholds() {
        t.clamp_utilization("BMC CPU utilization");
        assert!((MIN_UTILIZATION_THRESHOLD..=MAX_UTILIZATION_THRESHOLD).contains(&t.value));
    }

    // re-serializing a parsed configuration yields a document that parses
    if let Ok(json) = serde_json::to_string(&config) {
        let _ = HealthdConfig::from_json_str(&json);
    }
});
