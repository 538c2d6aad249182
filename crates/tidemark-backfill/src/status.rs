//! Status summaries.
//!
//! A summary is derived, never persisted: recomputing it from the run state
//! has no side effects and is safe from another process mid-execution.

use crate::state::{BackfillRunState, ChunkStatus, PlanStatus};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Counts per chunk status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    /// Total chunks.
    pub total: usize,
    /// Chunks not yet dispatched.
    pub pending: usize,
    /// Chunks currently dispatched.
    pub running: usize,
    /// Chunks executed successfully.
    pub done: usize,
    /// Chunks that exhausted retries.
    pub failed: usize,
    /// Chunks deliberately not executed.
    pub skipped: usize,
}

/// Read-only aggregate of a run.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillStatusSummary {
    /// Plan the run belongs to.
    pub plan_id: String,
    /// Target object.
    pub target: String,
    /// Run status.
    pub status: PlanStatus,
    /// Counts per chunk status.
    pub chunks: ChunkCounts,
    /// Total execution attempts across all chunks.
    pub attempts: u32,
    /// When the run state last changed.
    pub updated_at: DateTime<Utc>,
    /// Last run-level error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Path of the run document.
    pub run_path: PathBuf,
    /// Path of the event log.
    pub events_path: PathBuf,
}

/// Recompute the summary for a run.
pub fn summarize(run: &BackfillRunState, store: &StateStore) -> BackfillStatusSummary {
    let mut counts = ChunkCounts {
        total: run.chunks.len(),
        ..Default::default()
    };
    let mut attempts = 0u32;
    for chunk in &run.chunks {
        attempts += chunk.attempts;
        match chunk.status {
            ChunkStatus::Pending => counts.pending += 1,
            ChunkStatus::Running => counts.running += 1,
            ChunkStatus::Done => counts.done += 1,
            ChunkStatus::Failed => counts.failed += 1,
            ChunkStatus::Skipped => counts.skipped += 1,
        }
    }

    BackfillStatusSummary {
        plan_id: run.plan_id.to_string(),
        target: run.target.clone(),
        status: run.status,
        chunks: counts,
        attempts,
        updated_at: run.updated_at,
        last_error: run.last_error.clone(),
        run_path: store.run_path(&run.plan_id),
        events_path: store.events_path(&run.plan_id),
    }
}
