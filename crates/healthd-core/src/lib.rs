//! healthd-core: BMC health monitoring library
//!
//! This crate provides the monitors, alarm engine, and health aggregation
//! behind the `healthd` daemon.
//!
//! # Architecture
//!
//! ```text
//! HostMetrics / PhysicalMemory / Platform
//!                 ↓
//!     Monitors (cpu, mem, ecc, i2c, nm)  ──→  ThresholdSet (assert/deassert)
//!                 ↓                                   ↓
//!            Supervisor threads              HealthAggregator → KvStore
//! ```
//!
//! # Modules
//!
//! - `threshold`: assert/deassert engine with hysteresis and actions
//! - `window`: fixed-size moving average
//! - `utilization`: CPU and memory monitors
//! - `ecc`: ECC counter monitor over the memory controller registers
//! - `i2c`: bus-fault decoder and monitor
//! - `aggregator`: health bitmask, persisted flag, periodic regeneration
//! - `nm`: Node Manager self-test retry monitor
//! - `vboot`: verified-boot startup reconciliation
//! - `heartbeat`, `fw_update`: heartbeat LED, watchdog kicks, reboot guard
//! - `supervisor`: thread-per-monitor scheduling
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! Unsafe code is denied crate-wide; the only exception is the volatile
//! register read in `registers`.

#![deny(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod ecc;
pub mod error;
pub mod fw_update;
pub mod heartbeat;
pub mod i2c;
pub mod kv;
pub mod logging;
pub mod metrics;
pub mod nm;
pub mod platform;
pub mod reboot;
pub mod registers;
pub mod supervisor;
pub mod threshold;
pub mod utilization;
pub mod vboot;
pub mod window;

pub use aggregator::{HealthAggregator, HealthBit};
pub use config::HealthdConfig;
pub use error::{HealthError, Result};
pub use supervisor::{Dependencies, Monitor, Poll, Supervisor};
pub use threshold::{SignalKind, Threshold, ThresholdSet};

/// Version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
