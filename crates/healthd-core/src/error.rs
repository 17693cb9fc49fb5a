//! Error types for healthd-core

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<(String, String)>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
        }
    }

    /// Add a labelled command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);
        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
            }
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, HealthError>;

/// Main error type for healthd-core
#[derive(Error, Debug)]
pub enum HealthError {
    /// I/O errors (procfs, sysfs, /dev/mem, kv files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// A host statistic could not be parsed
    #[error("Malformed {source_name}: {detail}")]
    Parse {
        source_name: &'static str,
        detail: String,
    },

    /// Register access outside the mapped window
    #[error("register offset {offset:#x} (+{width}) outside {len:#x}-byte window at {base:#x}")]
    RegisterOutOfRange {
        base: u64,
        offset: usize,
        width: usize,
        len: usize,
    },

    /// Key-value store errors
    #[error("kv store error for key `{key}`: {detail}")]
    Kv { key: String, detail: String },

    /// Platform collaborator reported a failure
    #[error("platform error: {0}")]
    Platform(String),

    /// Operation is not provided by this platform
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    /// A monitor thread could not be started
    #[error("failed to spawn monitor `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl HealthError {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(_) | Self::Json(_) => Some(
                Remediation::new("Validate the healthd configuration file and restart healthd.")
                    .command("Validate JSON", "python -m json.tool < /etc/healthd-config.json"),
            ),
            Self::Io(_) | Self::RegisterOutOfRange { .. } => Some(
                Remediation::new("Check that healthd runs as root and /dev/mem is accessible.")
                    .command("Check /dev/mem", "ls -l /dev/mem"),
            ),
            Self::Kv { .. } => Some(
                Remediation::new("Check that the kv store directory exists and is writable.")
                    .command("Check kv store", "ls -la /mnt/data/kv_store"),
            ),
            Self::Spawn { .. } => Some(Remediation::new(
                "The system could not start a monitor thread; check memory and thread limits.",
            )),
            Self::Parse { .. } | Self::Platform(_) | Self::Unsupported(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_error_display() {
        let err = HealthError::RegisterOutOfRange {
            base: 0x1e6e_0000,
            offset: 0xffe,
            width: 4,
            len: 0x1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xffe"));
        assert!(msg.contains("0x1e6e0000"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HealthError = io_err.into();
        assert!(matches!(err, HealthError::Io(_)));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn remediation_render_lists_commands() {
        let text = Remediation::new("do the thing")
            .command("Check", "ls")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("- Check: ls"));
    }

    #[test]
    fn unsupported_has_no_remediation() {
        assert!(HealthError::Unsupported("i2c").remediation().is_none());
    }
}
