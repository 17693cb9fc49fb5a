//! Threshold/hysteresis alarm engine.
//!
//! Each [`Threshold`] is an independent assert/deassert latch:
//!
//! - **assert** when not asserted and `value >= threshold.value`
//! - **deassert** when asserted and `value < threshold.value - hysteresis`
//!
//! Both checks run in that order for every threshold on every sample. A
//! threshold with the `reboot` action ends evaluation with a
//! [`RebootRequest`] that the monitor loop carries out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregator::{HealthAggregator, HealthBit};
use crate::logging::LogLevel;
use crate::platform::Platform;

/// Lower bound applied to CPU and memory threshold values.
pub const MIN_UTILIZATION_THRESHOLD: f64 = 60.0;
/// Upper bound applied to CPU and memory threshold values.
pub const MAX_UTILIZATION_THRESHOLD: f64 = 95.0;

// =============================================================================
// Signal kinds
// =============================================================================

/// Signals that feed the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    CpuUtilization,
    MemoryUtilization,
    RecoverableEcc,
    UnrecoverableEcc,
}

impl SignalKind {
    /// Name used in log lines and platform notifications.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::CpuUtilization => "BMC CPU utilization",
            Self::MemoryUtilization => "BMC Memory utilization",
            Self::RecoverableEcc => "ECC Recoverable Error",
            Self::UnrecoverableEcc => "ECC Unrecoverable Error",
        }
    }

    #[must_use]
    pub const fn health_bit(self) -> HealthBit {
        match self {
            Self::CpuUtilization => HealthBit::CpuOverThreshold,
            Self::MemoryUtilization => HealthBit::MemOverThreshold,
            Self::RecoverableEcc => HealthBit::RecoverableEcc,
            Self::UnrecoverableEcc => HealthBit::UnrecoverableEcc,
        }
    }

    /// Whether configured values are clamped to the utilization safe range.
    #[must_use]
    pub const fn clamps_threshold(self) -> bool {
        matches!(self, Self::CpuUtilization | Self::MemoryUtilization)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

// =============================================================================
// Threshold
// =============================================================================

/// Action keyword from the `action` array of a threshold record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAction {
    LogWarning,
    LogCritical,
    Reboot,
    BmcErrorTrigger,
}

impl std::str::FromStr for ThresholdAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log-warning" => Ok(Self::LogWarning),
            "log-critical" => Ok(Self::LogCritical),
            "reboot" => Ok(Self::Reboot),
            "bmc-error-trigger" => Ok(Self::BmcErrorTrigger),
            _ => Err(format!("unknown threshold action: {s}")),
        }
    }
}

/// One alarm rule and its latch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Threshold {
    pub value: f64,
    pub hysteresis: f64,
    /// Severity of ASSERT/DEASSERT lines; `None` disables logging.
    pub log: Option<LogLevel>,
    pub reboot: bool,
    pub bmc_error_trigger: bool,
    asserted: bool,
}

impl Threshold {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    /// Apply an action keyword. Later log actions override earlier ones.
    #[must_use]
    pub fn with_action(mut self, action: ThresholdAction) -> Self {
        match action {
            ThresholdAction::LogWarning => self.log = Some(LogLevel::Warning),
            ThresholdAction::LogCritical => self.log = Some(LogLevel::Critical),
            ThresholdAction::Reboot => self.reboot = true,
            ThresholdAction::BmcErrorTrigger => self.bmc_error_trigger = true,
        }
        self
    }

    #[must_use]
    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    /// Clamp `value` into the utilization safe range, warning when changed.
    pub fn clamp_utilization(&mut self, signal: &str) {
        if self.value > MAX_UTILIZATION_THRESHOLD {
            tracing::warn!(
                signal,
                configured = self.value,
                "user setting {signal} threshold {:.2} is too high and set threshold as {MAX_UTILIZATION_THRESHOLD:.2}",
                self.value
            );
            self.value = MAX_UTILIZATION_THRESHOLD;
        }
        if self.value < MIN_UTILIZATION_THRESHOLD {
            tracing::warn!(
                signal,
                configured = self.value,
                "user setting {signal} threshold {:.2} is too low and set threshold as {MIN_UTILIZATION_THRESHOLD:.2}",
                self.value
            );
            self.value = MIN_UTILIZATION_THRESHOLD;
        }
    }

    /// Same rule with value and hysteresis rescaled from percent of
    /// `max_counter` to counter units. The latch is not copied.
    #[must_use]
    pub fn to_counter_scale(&self, max_counter: u32) -> Self {
        let scale = f64::from(max_counter) / 100.0;
        Self {
            value: self.value * scale,
            hysteresis: self.hysteresis * scale,
            asserted: false,
            ..self.clone()
        }
    }

    fn log_level(&self) -> LogLevel {
        self.log.unwrap_or_default()
    }
}

/// Threshold record as written in the configuration file.
///
/// A record without a numeric `value` yields an inert threshold at 0 with no
/// actions. Non-string and unknown action entries are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub value: Option<f64>,
    pub hysteresis: Option<f64>,
    pub action: Vec<serde_json::Value>,
}

impl ThresholdConfig {
    #[must_use]
    pub fn to_threshold(&self) -> Threshold {
        let Some(value) = self.value else {
            return Threshold::default();
        };
        let mut threshold = Threshold::new(value).with_hysteresis(self.hysteresis.unwrap_or(0.0));
        for action in self.action.iter().filter_map(serde_json::Value::as_str) {
            match action.parse::<ThresholdAction>() {
                Ok(action) => threshold = threshold.with_action(action),
                Err(err) => tracing::debug!(%err, "ignoring threshold action"),
            }
        }
        threshold
    }
}

/// Convert a list of records.
#[must_use]
pub fn thresholds_from_config(records: &[ThresholdConfig]) -> Vec<Threshold> {
    records.iter().map(ThresholdConfig::to_threshold).collect()
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Assert,
    Deassert,
}

/// A latch change produced by one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// Index of the threshold in its set.
    pub index: usize,
    pub kind: TransitionKind,
    pub value: f64,
    pub threshold: f64,
}

/// Request to reboot the BMC, produced by a `reboot` action.
#[derive(Debug, Clone, PartialEq)]
pub struct RebootRequest {
    pub signal: String,
    pub value: f64,
    pub threshold: f64,
    pub level: LogLevel,
}

/// Result of checking one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckOutcome {
    pub transitions: Vec<Transition>,
    pub reboot: Option<RebootRequest>,
}

impl CheckOutcome {
    pub fn asserts(&self) -> impl Iterator<Item = &Transition> {
        self.transitions
            .iter()
            .filter(|t| t.kind == TransitionKind::Assert)
    }
}

// =============================================================================
// ThresholdSet
// =============================================================================

/// The thresholds of one signal, with the side effects they drive.
pub struct ThresholdSet {
    kind: SignalKind,
    name: String,
    thresholds: Vec<Threshold>,
    aggregator: Arc<HealthAggregator>,
    platform: Arc<dyn Platform>,
    seen_generation: u64,
}

impl std::fmt::Debug for ThresholdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdSet")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ThresholdSet {
    /// Build a set for `kind`. Utilization signals have their values clamped.
    pub fn new(
        kind: SignalKind,
        thresholds: Vec<Threshold>,
        aggregator: Arc<HealthAggregator>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let name = kind.display_name().to_string();
        let mut thresholds = thresholds;
        if kind.clamps_threshold() {
            for t in &mut thresholds {
                t.clamp_utilization(&name);
            }
        }
        let seen_generation = aggregator.generation();
        Self {
            kind,
            name,
            thresholds,
            aggregator,
            platform,
            seen_generation,
        }
    }

    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Evaluate one sample against every threshold.
    pub fn check(&mut self, value: f64) -> CheckOutcome {
        self.observe_regeneration();

        let mut outcome = CheckOutcome::default();
        if value.is_nan() {
            return outcome;
        }
        for index in 0..self.thresholds.len() {
            if let Some(transition) = self.assert_check(index, value) {
                outcome.transitions.push(transition);
                let t = &self.thresholds[index];
                if t.reboot {
                    outcome.reboot = Some(RebootRequest {
                        signal: self.name.clone(),
                        value,
                        threshold: t.value,
                        level: t.log_level(),
                    });
                    return outcome;
                }
                if t.bmc_error_trigger {
                    self.aggregator.raise(self.kind.health_bit());
                    self.platform.bmc_error_enable(&self.name);
                }
            }
            if let Some(transition) = self.deassert_check(index, value) {
                outcome.transitions.push(transition);
                if self.thresholds[index].bmc_error_trigger {
                    self.aggregator.lower(self.kind.health_bit());
                    self.platform.bmc_error_disable(&self.name);
                }
            }
        }
        outcome
    }

    /// Drop all latches if the aggregator regenerated since the last check.
    fn observe_regeneration(&mut self) {
        let generation = self.aggregator.generation();
        if generation != self.seen_generation {
            for t in &mut self.thresholds {
                t.asserted = false;
            }
            self.seen_generation = generation;
        }
    }

    fn assert_check(&mut self, index: usize, value: f64) -> Option<Transition> {
        let t = &mut self.thresholds[index];
        if t.asserted || value < t.value {
            return None;
        }
        t.asserted = true;
        if let Some(level) = t.log {
            crate::alarm_event!(
                level,
                signal = %self.name,
                value,
                threshold = t.value,
                "ASSERT: {} ({value:.2}%) exceeds the threshold ({:.2}%).",
                self.name,
                t.value
            );
        }
        Some(Transition {
            index,
            kind: TransitionKind::Assert,
            value,
            threshold: t.value,
        })
    }

    fn deassert_check(&mut self, index: usize, value: f64) -> Option<Transition> {
        let t = &mut self.thresholds[index];
        if !t.asserted || value >= t.value - t.hysteresis {
            return None;
        }
        t.asserted = false;
        if let Some(level) = t.log {
            crate::alarm_event!(
                level,
                signal = %self.name,
                value,
                threshold = t.value,
                "DEASSERT: {} ({value:.2}%) is under the threshold ({:.2}%).",
                self.name,
                t.value
            );
        }
        Some(Transition {
            index,
            kind: TransitionKind::Deassert,
            value,
            threshold: t.value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{BMC_HEALTH_KEY, MemoryKvStore};
    use crate::logging::test_support::capture_logs;
    use crate::platform::{PlatformEvent, RecordingPlatform};

    struct Fixture {
        kv: Arc<MemoryKvStore>,
        agg: Arc<HealthAggregator>,
        platform: Arc<RecordingPlatform>,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryKvStore::new());
        let agg = Arc::new(HealthAggregator::new(kv.clone()));
        Fixture {
            kv,
            agg,
            platform: Arc::new(RecordingPlatform::new()),
        }
    }

    fn set(fx: &Fixture, kind: SignalKind, thresholds: Vec<Threshold>) -> ThresholdSet {
        ThresholdSet::new(kind, thresholds, fx.agg.clone(), fx.platform.clone())
    }

    #[test]
    fn action_keywords_parse() {
        assert_eq!("log-warning".parse(), Ok(ThresholdAction::LogWarning));
        assert_eq!("log-critical".parse(), Ok(ThresholdAction::LogCritical));
        assert_eq!("reboot".parse(), Ok(ThresholdAction::Reboot));
        assert_eq!("bmc-error-trigger".parse(), Ok(ThresholdAction::BmcErrorTrigger));
        assert!("shutdown".parse::<ThresholdAction>().is_err());
    }

    #[test]
    fn utilization_values_are_clamped() {
        let fx = fixture();
        let s = set(
            &fx,
            SignalKind::CpuUtilization,
            vec![Threshold::new(99.0), Threshold::new(10.0), Threshold::new(80.0)],
        );
        let values: Vec<f64> = s.thresholds().iter().map(|t| t.value).collect();
        assert_eq!(values, vec![95.0, 60.0, 80.0]);

        let ecc = set(&fx, SignalKind::RecoverableEcc, vec![Threshold::new(10.0)]);
        assert_eq!(ecc.thresholds()[0].value, 10.0);
    }

    #[test]
    fn latches_until_deassert() {
        let fx = fixture();
        let mut s = set(
            &fx,
            SignalKind::CpuUtilization,
            vec![Threshold::new(80.0).with_hysteresis(5.0)],
        );
        assert_eq!(s.check(80.0).asserts().count(), 1);
        assert!(s.check(90.0).transitions.is_empty());
        // equality with value - hysteresis does not deassert
        assert!(s.check(75.0).transitions.is_empty());
        let out = s.check(74.99);
        assert_eq!(out.transitions.len(), 1);
        assert_eq!(out.transitions[0].kind, TransitionKind::Deassert);
        assert!(!s.thresholds()[0].is_asserted());
    }

    #[test]
    fn zero_hysteresis_shares_boundary() {
        let fx = fixture();
        let mut s = set(&fx, SignalKind::MemoryUtilization, vec![Threshold::new(70.0)]);
        assert_eq!(s.check(70.0).asserts().count(), 1);
        assert!(s.check(70.0).transitions.is_empty());
        let out = s.check(69.9);
        assert_eq!(out.transitions[0].kind, TransitionKind::Deassert);
    }

    #[test]
    fn thresholds_are_independent() {
        let fx = fixture();
        let mut s = set(
            &fx,
            SignalKind::CpuUtilization,
            vec![Threshold::new(70.0), Threshold::new(90.0)],
        );
        let out = s.check(80.0);
        assert_eq!(out.transitions.len(), 1);
        assert_eq!(out.transitions[0].index, 0);
        let out = s.check(95.0);
        assert_eq!(out.transitions.len(), 1);
        assert_eq!(out.transitions[0].index, 1);
    }

    #[test]
    fn log_wording_and_levels() {
        let fx = fixture();
        let mut s = set(
            &fx,
            SignalKind::CpuUtilization,
            vec![Threshold::new(80.0).with_action(ThresholdAction::LogCritical)],
        );
        let ((), logs) = capture_logs(|| {
            s.check(85.0);
            s.check(50.0);
        });
        let out = logs.contents();
        assert!(out.contains(
            "ASSERT: BMC CPU utilization (85.00%) exceeds the threshold (80.00%)."
        ));
        assert!(out.contains(
            "DEASSERT: BMC CPU utilization (50.00%) is under the threshold (80.00%)."
        ));
        assert_eq!(logs.count("ERROR"), 2);
    }

    #[test]
    fn no_log_action_stays_silent() {
        let fx = fixture();
        let mut s = set(&fx, SignalKind::CpuUtilization, vec![Threshold::new(80.0)]);
        let ((), logs) = capture_logs(|| {
            s.check(85.0);
        });
        assert_eq!(logs.count("ASSERT"), 0);
        assert!(s.thresholds()[0].is_asserted());
    }

    #[test]
    fn bmc_error_trigger_drives_aggregator_and_platform() {
        let fx = fixture();
        let mut s = set(
            &fx,
            SignalKind::MemoryUtilization,
            vec![Threshold::new(80.0).with_action(ThresholdAction::BmcErrorTrigger)],
        );
        s.check(90.0);
        assert!(fx.agg.is_set(HealthBit::MemOverThreshold));
        s.check(10.0);
        assert_eq!(fx.agg.bits(), 0);
        assert_eq!(fx.kv.writes_for(BMC_HEALTH_KEY), vec!["0", "1"]);
        assert_eq!(
            fx.platform.events(),
            vec![
                PlatformEvent::BmcErrorEnable("BMC Memory utilization".to_string()),
                PlatformEvent::BmcErrorDisable("BMC Memory utilization".to_string()),
            ]
        );
    }

    #[test]
    fn reboot_stops_evaluation() {
        let fx = fixture();
        let mut s = set(
            &fx,
            SignalKind::CpuUtilization,
            vec![
                Threshold::new(80.0)
                    .with_action(ThresholdAction::Reboot)
                    .with_action(ThresholdAction::LogCritical)
                    .with_action(ThresholdAction::BmcErrorTrigger),
                Threshold::new(70.0).with_action(ThresholdAction::BmcErrorTrigger),
            ],
        );
        let out = s.check(90.0);
        let req = out.reboot.expect("reboot requested");
        assert_eq!(req.signal, "BMC CPU utilization");
        assert_eq!(req.level, LogLevel::Critical);
        assert_eq!(out.transitions.len(), 1);
        assert!(!s.thresholds()[1].is_asserted());
        assert_eq!(fx.agg.bits(), 0);
    }

    #[test]
    fn regeneration_clears_latches() {
        let fx = fixture();
        let mut s = set(&fx, SignalKind::CpuUtilization, vec![Threshold::new(80.0)]);
        assert_eq!(s.check(90.0).asserts().count(), 1);
        assert!(s.check(90.0).transitions.is_empty());
        fx.agg.regenerate();
        assert_eq!(s.check(90.0).asserts().count(), 1);
    }

    #[test]
    fn config_records_convert() {
        let records: Vec<ThresholdConfig> = serde_json::from_str(
            r#"[
                {"value": 80.0, "hysteresis": 5.0, "action": ["log-critical", "bmc-error-trigger", 7, "dance"]},
                {"value": 90, "action": ["log-warning", "reboot"]},
                {"hysteresis": 3.0, "action": ["log-critical"]}
            ]"#,
        )
        .unwrap();
        let t = thresholds_from_config(&records);
        assert_eq!(t[0].value, 80.0);
        assert_eq!(t[0].hysteresis, 5.0);
        assert_eq!(t[0].log, Some(LogLevel::Critical));
        assert!(t[0].bmc_error_trigger);
        assert!(!t[0].reboot);
        assert_eq!(t[1].value, 90.0);
        assert_eq!(t[1].log, Some(LogLevel::Warning));
        assert!(t[1].reboot);
        assert_eq!(t[2], Threshold::default());
    }

    #[test]
    fn counter_scale_conversion() {
        let t = Threshold::new(50.0)
            .with_hysteresis(10.0)
            .with_action(ThresholdAction::BmcErrorTrigger);
        let c = t.to_counter_scale(255);
        assert!((c.value - 127.5).abs() < 1e-9);
        assert!((c.hysteresis - 25.5).abs() < 1e-9);
        assert!(c.bmc_error_trigger);
        assert!(!c.is_asserted());
    }
}
