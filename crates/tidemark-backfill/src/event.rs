//! The append-only event log.
//!
//! Every chunk and run transition is appended as one NDJSON line under
//! `events/<planId>.ndjson`. The log is for audit and diagnosis only; the run
//! file alone is authoritative for correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A fresh run started.
    RunStarted,
    /// An existing run was resumed.
    RunResumed,
    /// A chunk was dispatched.
    ChunkStarted,
    /// A chunk finished successfully.
    ChunkDone,
    /// A chunk exhausted its retries (or hit a fatal error).
    ChunkFailed,
    /// A chunk was reset to pending by a replay decision.
    ChunkReplayed,
    /// A chunk was marked skipped by an explicit decision.
    ChunkSkipped,
    /// The run completed.
    RunCompleted,
    /// The run failed.
    RunFailed,
    /// The run was cancelled.
    RunCancelled,
    /// The run was paused.
    RunPaused,
    /// A risky override was applied.
    ForceApplied,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillEvent {
    /// Schema version of the event record.
    pub version: u32,
    /// When the event was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
    /// Chunk involved, for chunk-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
    /// Attempts recorded at the time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Free-form detail (error text, override flag, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BackfillEvent {
    /// Current event schema version.
    pub const VERSION: u32 = 1;

    /// Create a run-level event.
    pub fn run(kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            version: Self::VERSION,
            at,
            kind,
            chunk_id: None,
            attempts: None,
            message: None,
        }
    }

    /// Create a chunk-level event.
    pub fn chunk(kind: EventKind, chunk_id: u32, at: DateTime<Utc>) -> Self {
        Self {
            chunk_id: Some(chunk_id),
            ..Self::run(kind, at)
        }
    }

    /// Attach an attempts count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Attach a detail message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = BackfillEvent::chunk(EventKind::ChunkFailed, 3, at)
            .with_attempts(2)
            .with_message("connection reset");

        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"chunk_failed\""));

        let parsed: BackfillEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.kind, EventKind::ChunkFailed);
        assert_eq!(parsed.chunk_id, Some(3));
        assert_eq!(parsed.attempts, Some(2));
    }

    #[test]
    fn test_run_event_omits_chunk_fields() {
        let event = BackfillEvent::run(EventKind::RunStarted, Utc::now());
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains("chunk_id"));
        assert!(!line.contains("attempts"));
    }
}
