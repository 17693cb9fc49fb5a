//! Process-wide BMC health bitmask and its persisted flag.
//!
//! Every read-modify-write of the bitmask, together with the key-value write
//! it may trigger, happens under one non-poisoning lock. The persisted
//! `bmc_health` key goes to `"0"` when the first bit is raised and back to
//! `"1"` when the last bit is lowered.
//!
//! [`BmcHealthReconciler`] periodically forgets all alarms so that still
//! present conditions are asserted (and logged) again. Thresholds are owned by
//! their monitor threads, so the reconciler does not touch them directly: it
//! bumps a regeneration counter which each [`ThresholdSet`] observes on its
//! next check.
//!
//! [`ThresholdSet`]: crate::threshold::ThresholdSet

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::kv::{BMC_HEALTH_KEY, HEALTHY, KvStore, NOT_HEALTHY};
use crate::supervisor::{Monitor, Poll};

// =============================================================================
// Health bits
// =============================================================================

/// Alarm category contributing to the health bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBit {
    CpuOverThreshold,
    MemOverThreshold,
    RecoverableEcc,
    UnrecoverableEcc,
}

impl HealthBit {
    /// Bit position in the mask.
    #[must_use]
    pub const fn position(self) -> u32 {
        match self {
            Self::CpuOverThreshold => 0,
            Self::MemOverThreshold => 1,
            Self::RecoverableEcc => 2,
            Self::UnrecoverableEcc => 3,
        }
    }

    #[must_use]
    pub const fn mask(self) -> u32 {
        1 << self.position()
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Shared health state. Cheap to clone through `Arc`.
pub struct HealthAggregator {
    bits: Mutex<u32>,
    kv: Arc<dyn KvStore>,
    generation: AtomicU64,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("bits", &*self.bits.lock())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl HealthAggregator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            bits: Mutex::new(0),
            kv,
            generation: AtomicU64::new(0),
        }
    }

    /// Current bitmask.
    #[must_use]
    pub fn bits(&self) -> u32 {
        *self.bits.lock()
    }

    #[must_use]
    pub fn is_set(&self, bit: HealthBit) -> bool {
        self.bits() & bit.mask() != 0
    }

    /// Set `bit`. Persists "unhealthy" if the mask was empty.
    pub fn raise(&self, bit: HealthBit) {
        let mut bits = self.bits.lock();
        if *bits == 0 {
            self.persist(NOT_HEALTHY);
        }
        *bits |= bit.mask();
    }

    /// Clear `bit`. Persists "healthy" if this empties the mask.
    pub fn lower(&self, bit: HealthBit) {
        let mut bits = self.bits.lock();
        let before = *bits;
        *bits &= !bit.mask();
        if before != 0 && *bits == 0 {
            self.persist(HEALTHY);
        }
    }

    /// Regeneration counter observed by threshold sets.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Forget every alarm: zero the mask and ask all threshold sets to drop
    /// their latches. The persisted flag is left alone.
    pub fn regenerate(&self) {
        let mut bits = self.bits.lock();
        *bits = 0;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Read the persisted flag. Read failures and missing or garbled values
    /// count as `0`.
    #[must_use]
    pub fn persisted_flag(&self) -> u8 {
        match self.kv.get(BMC_HEALTH_KEY) {
            Ok(Some(value)) => value.trim().parse().unwrap_or(0),
            Ok(None) => {
                tracing::error!("kv get bmc_health status failed: key missing");
                0
            }
            Err(err) => {
                tracing::error!(error = %err, "kv get bmc_health status failed");
                0
            }
        }
    }

    fn persist(&self, value: &str) {
        if let Err(err) = self.kv.set(BMC_HEALTH_KEY, value) {
            tracing::error!(error = %err, value, "failed to persist bmc_health");
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// `bmc_health` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmcHealthConfig {
    pub enabled: bool,
    pub monitor_interval: i64,
    /// Seconds after which alarms are regenerated unconditionally.
    pub regenerating_interval: u64,
}

impl Default for BmcHealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            monitor_interval: 1,
            regenerating_interval: 1200,
        }
    }
}

impl BmcHealthConfig {
    #[must_use]
    pub fn interval_secs(&self) -> u64 {
        u64::try_from(self.monitor_interval).unwrap_or(0).max(1)
    }
}

/// Periodic alarm regeneration (`bmc_health` section).
pub struct BmcHealthReconciler {
    aggregator: Arc<HealthAggregator>,
    interval: Duration,
    ticks_per_regeneration: u64,
    ticks: u64,
    last_state: u8,
}

impl BmcHealthReconciler {
    /// `interval_secs` is the polling cadence; `regenerating_interval_secs`
    /// the period after which alarms are forgotten unconditionally.
    pub fn new(
        aggregator: Arc<HealthAggregator>,
        interval_secs: u64,
        regenerating_interval_secs: u64,
    ) -> Self {
        let interval_secs = interval_secs.max(1);
        Self {
            aggregator,
            interval: Duration::from_secs(interval_secs),
            ticks_per_regeneration: regenerating_interval_secs / interval_secs,
            ticks: 0,
            last_state: 1,
        }
    }

    /// One reconciliation step. Returns true when alarms were regenerated.
    pub fn tick(&mut self) -> bool {
        let state = self.aggregator.persisted_flag();
        // Cleared externally (e.g. the SEL was wiped) or periodic regeneration.
        let cleared = self.last_state == 0 && state == 1;
        let regenerate = self.ticks >= self.ticks_per_regeneration || cleared;
        if regenerate {
            tracing::debug!(cleared, ticks = self.ticks, "regenerating health alarms");
            self.aggregator.regenerate();
            self.ticks = 0;
        }
        self.last_state = state;
        self.ticks += 1;
        regenerate
    }
}

impl Monitor for BmcHealthReconciler {
    fn name(&self) -> &'static str {
        "bmc-health"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn poll(&mut self) -> Poll {
        self.tick();
        Poll::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn setup() -> (Arc<MemoryKvStore>, Arc<HealthAggregator>) {
        let kv = Arc::new(MemoryKvStore::new());
        let agg = Arc::new(HealthAggregator::new(kv.clone()));
        (kv, agg)
    }

    #[test]
    fn bit_positions() {
        assert_eq!(HealthBit::CpuOverThreshold.mask(), 0b0001);
        assert_eq!(HealthBit::MemOverThreshold.mask(), 0b0010);
        assert_eq!(HealthBit::RecoverableEcc.mask(), 0b0100);
        assert_eq!(HealthBit::UnrecoverableEcc.mask(), 0b1000);
    }

    #[test]
    fn flag_written_once_per_transition() {
        let (kv, agg) = setup();
        agg.raise(HealthBit::CpuOverThreshold);
        agg.raise(HealthBit::RecoverableEcc);
        agg.raise(HealthBit::CpuOverThreshold);
        assert_eq!(agg.bits(), 0b0101);
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0"]);

        agg.lower(HealthBit::CpuOverThreshold);
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0"]);
        agg.lower(HealthBit::RecoverableEcc);
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0", "1"]);
        assert_eq!(agg.bits(), 0);
    }

    #[test]
    fn concurrent_raise_lower_alternates_flag() {
        let (kv, agg) = setup();
        let bits = [
            HealthBit::CpuOverThreshold,
            HealthBit::MemOverThreshold,
            HealthBit::RecoverableEcc,
            HealthBit::UnrecoverableEcc,
        ];
        std::thread::scope(|s| {
            for bit in bits {
                let agg = &agg;
                s.spawn(move || {
                    for _ in 0..500 {
                        agg.raise(bit);
                        agg.lower(bit);
                    }
                });
            }
        });

        let writes = kv.writes_for(BMC_HEALTH_KEY);
        assert!(!writes.is_empty());
        for (i, value) in writes.iter().enumerate() {
            let expected = if i % 2 == 0 { NOT_HEALTHY } else { HEALTHY };
            assert_eq!(value, expected, "write {i} of {}", writes.len());
        }
        assert_eq!(agg.bits(), 0);
        assert_eq!(writes.last().map(String::as_str), Some(HEALTHY));
    }

    #[test]
    fn lower_on_empty_mask_writes_nothing() {
        let (kv, agg) = setup();
        agg.lower(HealthBit::MemOverThreshold);
        assert!(kv.writes().is_empty());
    }

    #[test]
    fn regenerate_zeroes_and_bumps() {
        let (kv, agg) = setup();
        agg.raise(HealthBit::UnrecoverableEcc);
        let g = agg.generation();
        agg.regenerate();
        assert_eq!(agg.bits(), 0);
        assert_eq!(agg.generation(), g + 1);
        // flag untouched by regeneration
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0"]);
        // the next raise sees an empty mask again
        agg.raise(HealthBit::UnrecoverableEcc);
        assert_eq!(kv.writes_for(BMC_HEALTH_KEY), vec!["0", "0"]);
    }

    #[test]
    fn persisted_flag_defaults_to_zero() {
        let (kv, agg) = setup();
        assert_eq!(agg.persisted_flag(), 0);
        kv.set(BMC_HEALTH_KEY, "1").unwrap();
        assert_eq!(agg.persisted_flag(), 1);
        kv.set(BMC_HEALTH_KEY, "garbage").unwrap();
        assert_eq!(agg.persisted_flag(), 0);
    }

    #[test]
    fn reconciler_periodic_regeneration() {
        let (kv, agg) = setup();
        kv.set(BMC_HEALTH_KEY, "1").unwrap();
        let mut rec = BmcHealthReconciler::new(agg.clone(), 1, 3);
        assert!(!rec.tick());
        assert!(!rec.tick());
        assert!(!rec.tick());
        assert!(rec.tick());
        assert_eq!(agg.generation(), 1);
        assert!(!rec.tick());
    }

    #[test]
    fn reconciler_regenerates_on_external_clear() {
        let (kv, agg) = setup();
        kv.set(BMC_HEALTH_KEY, "0").unwrap();
        let mut rec = BmcHealthReconciler::new(agg.clone(), 1, 1200);
        agg.raise(HealthBit::CpuOverThreshold);
        assert!(!rec.tick());
        kv.set(BMC_HEALTH_KEY, "1").unwrap();
        assert!(rec.tick());
        assert_eq!(agg.bits(), 0);
        assert!(!rec.tick());
    }

    #[test]
    fn reconciler_zero_interval_clamps() {
        let (_kv, agg) = setup();
        let rec = BmcHealthReconciler::new(agg, 0, 10);
        assert_eq!(rec.interval(), Duration::from_secs(1));
        assert_eq!(rec.ticks_per_regeneration, 10);
    }
}
