//! Structured preflight findings.
//!
//! Plugins report findings from `on_check`; the host decides what blocks.

use serde::{Deserialize, Serialize};

/// How serious a finding is. The gate itself never blocks; by convention the
/// host fails its check when any `Error` finding is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; no action needed.
    Info,
    /// Worth attention; does not fail the check.
    Warn,
    /// Should fail the host's check.
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One finding from a plugin's preflight evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckFinding {
    /// Stable machine-readable code (e.g. `backfill_plan_missing`).
    pub code: String,
    /// Human-readable explanation.
    pub message: String,
    /// Severity of the finding.
    pub severity: Severity,
    /// Optional structured context for tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CheckFinding {
    /// Create a finding without metadata.
    pub fn new(code: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            metadata: None,
        }
    }

    /// Attach structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
