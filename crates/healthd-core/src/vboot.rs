//! Verified-boot reconciliation, run once at startup.
//!
//! The boot ROM leaves its verdict in a small structure in SRAM. If the BMC
//! came up in recovery (or booted with an unenforced failure) the failure is
//! asserted, unless the persistent log already carries an unmatched ASSERT
//! for it. The persisted `vboot_error` tuple lets the next successful boot
//! emit the matching DEASSERT. The persisted value itself is not trusted to
//! decide whether to assert, since it lives on writable storage.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::{KvStore, VBOOT_ERROR_KEY};
use crate::registers::PhysicalMemory;

/// Verified-boot structure base.
pub const VBOOT_BASE: u64 = 0x1E72_0000;
pub const RECOVERY_FLAG_OFFSET: usize = 0x217;
pub const ERROR_TYPE_OFFSET: usize = 0x219;
pub const ERROR_CODE_OFFSET: usize = 0x21A;
pub const ERROR_TPM_OFFSET: usize = 0x21B;

/// Persistent log files searched for earlier verified-boot events.
pub const DEFAULT_LOG_FILES: [&str; 2] = ["/mnt/data/logfile", "/mnt/data/logfile.0"];

/// `verified_boot` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifiedBootConfig {
    pub enabled: bool,
}

/// Contents of the verified-boot structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VbootState {
    pub recovery: u8,
    pub error_type: u8,
    pub error_code: u8,
    pub tpm_error: u8,
}

impl VbootState {
    pub fn read(memory: &dyn PhysicalMemory) -> Result<Self> {
        let window = memory.map(VBOOT_BASE)?;
        Ok(Self {
            recovery: window.read_u8(RECOVERY_FLAG_OFFSET)?,
            error_type: window.read_u8(ERROR_TYPE_OFFSET)?,
            error_code: window.read_u8(ERROR_CODE_OFFSET)?,
            tpm_error: window.read_u8(ERROR_TPM_OFFSET)?,
        })
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error_type != 0 || self.error_code != 0
    }

    /// `"(type,code)"`, the form persisted and logged.
    #[must_use]
    pub fn error_tuple(&self) -> String {
        format!("({},{})", self.error_type, self.error_code)
    }
}

// =============================================================================
// Log history
// =============================================================================

/// Counts persistent log lines that record an event.
pub trait LogHistory: Send + Sync {
    /// Lines for which [`line_has_event`] holds.
    fn count_events(&self, event: &str) -> usize;
}

/// True if `event` starts a word somewhere in `line`.
///
/// Works for both the text format (`healthd: ASSERT: ...`) and the JSON
/// format (`"message":"ASSERT: ..."`), and keeps `ASSERT: x` from matching
/// inside `DEASSERT: x`.
#[must_use]
pub fn line_has_event(line: &str, event: &str) -> bool {
    line.match_indices(event)
        .any(|(at, _)| !line[..at].chars().next_back().is_some_and(char::is_alphanumeric))
}

/// [`LogHistory`] over plain log files; unreadable files count as empty.
#[derive(Debug, Clone)]
pub struct FileLogHistory {
    paths: Vec<PathBuf>,
}

impl FileLogHistory {
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for FileLogHistory {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_FILES)
    }
}

impl LogHistory for FileLogHistory {
    fn count_events(&self, event: &str) -> usize {
        self.paths
            .iter()
            .filter_map(|path| std::fs::read(path).ok())
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter(|line| line_has_event(line, event))
                    .count()
            })
            .sum()
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// What the startup check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VbootOutcome {
    /// A failure is active; `logged` is false if an unmatched ASSERT existed.
    Failure { tuple: String, logged: bool },
    /// Clean boot with no recorded history.
    Successful,
    /// Clean boot after a recorded failure, now deasserted.
    Recovered { previous: String },
    /// Clean boot, previous failure already deasserted.
    Unchanged,
}

/// Reconcile `state` with the log history and persisted error.
pub fn reconcile(state: &VbootState, kv: &dyn KvStore, history: &dyn LogHistory) -> VbootOutcome {
    if state.tpm_error != 0 {
        tracing::warn!(tpm_error = state.tpm_error, "Verified boot TPM error: {}", state.tpm_error);
    }

    if state.recovery != 0 || state.has_error() {
        let tuple = state.error_tuple();
        let asserts = history.count_events(&format!("ASSERT: Verified boot failure {tuple}"));
        let deasserts = history.count_events(&format!("DEASSERT: Verified boot failure {tuple}"));
        let logged = asserts <= deasserts;
        if logged {
            tracing::error!(recovery = state.recovery, "ASSERT: Verified boot failure {tuple}");
        }
        if let Err(err) = kv.set(VBOOT_ERROR_KEY, &tuple) {
            tracing::error!(error = %err, "failed to persist vboot_error");
        }
        return VbootOutcome::Failure { tuple, logged };
    }

    let previous = match kv.get(VBOOT_ERROR_KEY) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "vboot_error unreadable");
            None
        }
    };
    match previous {
        None => {
            tracing::info!("Verified boot successful!");
            VbootOutcome::Successful
        }
        Some(previous) if previous != "(0,0)" => {
            tracing::error!("DEASSERT: Verified boot failure {previous}");
            if let Err(err) = kv.set(VBOOT_ERROR_KEY, "(0,0)") {
                tracing::error!(error = %err, "failed to persist vboot_error");
            }
            VbootOutcome::Recovered { previous }
        }
        Some(_) => VbootOutcome::Unchanged,
    }
}

/// Read the structure and reconcile. Mapping failures are logged and skip
/// the check.
pub fn check_vboot_state(
    memory: &dyn PhysicalMemory,
    kv: &dyn KvStore,
    history: &dyn LogHistory,
) -> Option<VbootOutcome> {
    match VbootState::read(memory) {
        Ok(state) => Some(reconcile(&state, kv, history)),
        Err(err) => {
            tracing::error!(error = %err, "Error mapping verified boot structure");
            None
        }
    }
}
