//! Run state: the mutable record of one execution attempt of a plan.
//!
//! The plan records what was intended; the run records what actually
//! happened. The run is checkpointed to disk on every transition so a crashed
//! coordinator can resume exactly where it stopped.

use crate::chunk::BackfillChunk;
use crate::plan::{BackfillPlanState, PlanId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plan-level (and run-level) lifecycle.
///
/// `planned → running → {paused, completed, failed, cancelled}`; `running`
/// may return to `paused`. The terminal states are only re-entered through a
/// replay-aware resume accepted by the compatibility guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created but never started.
    Planned,
    /// A coordinator is (or was, if it crashed) executing chunks.
    Running,
    /// Stopped by an operator with intent to continue.
    Paused,
    /// Every chunk reached `done` (or `skipped`).
    Completed,
    /// At least one chunk exhausted its retries.
    Failed,
    /// Stopped by an operator; not expected to continue.
    Cancelled,
}

impl PlanStatus {
    /// Whether this status ends the lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Planned => write!(f, "planned"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Paused => write!(f, "paused"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-chunk lifecycle: `pending → running → {done, failed}`. `skipped` is
/// only reachable through an explicit replay decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Not yet dispatched.
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Executed successfully.
    Done,
    /// Retries exhausted (or a fatal error).
    Failed,
    /// Deliberately not executed.
    Skipped,
}

impl ChunkStatus {
    /// Whether this chunk needs no further dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Done | ChunkStatus::Failed | ChunkStatus::Skipped
        )
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkStatus::Pending => write!(f, "pending"),
            ChunkStatus::Running => write!(f, "running"),
            ChunkStatus::Done => write!(f, "done"),
            ChunkStatus::Failed => write!(f, "failed"),
            ChunkStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Runtime state of one chunk within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRunChunkState {
    /// Chunk id, matching the plan's chunk of the same id.
    pub id: u32,
    /// Window start, inclusive.
    pub from: DateTime<Utc>,
    /// Window end, exclusive.
    pub to: DateTime<Utc>,
    /// Current status.
    pub status: ChunkStatus,
    /// Execution attempts so far (counting the successful one).
    pub attempts: u32,
    /// When the current or last attempt batch started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the chunk reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last execution error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BackfillRunChunkState {
    fn from_plan_chunk(chunk: &BackfillChunk) -> Self {
        Self {
            id: chunk.id,
            from: chunk.from,
            to: chunk.to,
            status: ChunkStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Mark the chunk as dispatched.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = ChunkStatus::Running;
        self.started_at = Some(now);
    }

    /// Mark the chunk as done.
    pub fn complete(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.status = ChunkStatus::Done;
        self.attempts = attempts;
        self.completed_at = Some(now);
        self.last_error = None;
    }

    /// Mark the chunk as failed with its last error.
    pub fn fail(&mut self, attempts: u32, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = ChunkStatus::Failed;
        self.attempts = attempts;
        self.completed_at = Some(now);
        self.last_error = Some(error.into());
    }

    /// Mark the chunk as deliberately not executed.
    pub fn skip(&mut self, now: DateTime<Utc>) {
        self.status = ChunkStatus::Skipped;
        self.completed_at = Some(now);
    }

    /// Reset the chunk to pending, granting a fresh retry budget. Used by
    /// crash recovery (`running` leftovers) and explicit replays.
    pub fn reset(&mut self) {
        self.status = ChunkStatus::Pending;
        self.attempts = 0;
        self.started_at = None;
        self.completed_at = None;
        self.last_error = None;
    }
}

/// The mutable execution record for one run of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRunState {
    /// Plan this run executes.
    pub plan_id: PlanId,
    /// Target object, copied from the plan.
    pub target: String,
    /// Run lifecycle status.
    pub status: PlanStatus,
    /// When the run record was created.
    pub created_at: DateTime<Utc>,
    /// When execution first started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Bumped on every persisted transition.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last run-level error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether a resume chose to re-execute chunks already `done`.
    pub replay_done: bool,
    /// Whether a resume chose to re-execute chunks already `failed`.
    pub replay_failed: bool,
    /// Hash of the options this run began with; drift blocks resume.
    pub compatibility_token: String,
    /// Forced overrides applied to this run, for audit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forced: Vec<String>,
    /// Per-chunk runtime state.
    pub chunks: Vec<BackfillRunChunkState>,
}

impl BackfillRunState {
    /// Create a fresh run record for a plan. All chunks start pending.
    pub fn new(plan: &BackfillPlanState, now: DateTime<Utc>) -> Self {
        Self {
            plan_id: plan.plan_id.clone(),
            target: plan.target.clone(),
            status: PlanStatus::Planned,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            last_error: None,
            replay_done: false,
            replay_failed: false,
            compatibility_token: plan.options.compatibility_token(),
            forced: Vec::new(),
            chunks: plan
                .chunks
                .iter()
                .map(BackfillRunChunkState::from_plan_chunk)
                .collect(),
        }
    }

    /// Mark the run as started.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = PlanStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.touch(now);
    }

    /// Mark the run as completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = PlanStatus::Completed;
        self.completed_at = Some(now);
        self.last_error = None;
        self.touch(now);
    }

    /// Mark the run as failed.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = PlanStatus::Failed;
        self.completed_at = Some(now);
        self.last_error = Some(error.into());
        self.touch(now);
    }

    /// Mark the run as cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = PlanStatus::Cancelled;
        self.completed_at = Some(now);
        self.touch(now);
    }

    /// Mark the run as paused.
    pub fn pause(&mut self, now: DateTime<Utc>) {
        self.status = PlanStatus::Paused;
        self.touch(now);
    }

    /// Record a forced override for audit.
    pub fn record_force(&mut self, flag: &str) {
        if !self.forced.iter().any(|f| f == flag) {
            self.forced.push(flag.to_string());
        }
    }

    /// Bump the update timestamp. Called by every persisted transition.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Chunk state by id.
    pub fn chunk(&self, id: u32) -> Option<&BackfillRunChunkState> {
        self.chunks.iter().find(|c| c.id == id)
    }

    /// Chunk state by id, mutable.
    pub fn chunk_mut(&mut self, id: u32) -> Option<&mut BackfillRunChunkState> {
        self.chunks.iter_mut().find(|c| c.id == id)
    }

    /// Ids of chunks not yet in a terminal state, in plan order.
    pub fn pending_chunk_ids(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .map(|c| c.id)
            .collect()
    }

    /// Whether any chunk failed with its retries exhausted.
    pub fn has_exhausted_failures(&self, max_retries: u32) -> bool {
        self.chunks
            .iter()
            .any(|c| c.status == ChunkStatus::Failed && c.attempts >= max_retries)
    }

    /// Whether every chunk reached `done` or `skipped`.
    pub fn all_chunks_succeeded(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| matches!(c.status, ChunkStatus::Done | ChunkStatus::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ResolvedBackfill;
    use crate::plan::PlanBuilder;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sample_run() -> BackfillRunState {
        let resolved = ResolvedBackfill::default();
        let plan = PlanBuilder::new("events", &resolved)
            .window(ts("2024-01-01T00:00:00Z"), ts("2024-01-03T00:00:00Z"), true)
            .sql_template("INSERT /* {token} */")
            .build()
            .unwrap();
        BackfillRunState::new(&plan, ts("2024-01-05T00:00:00Z"))
    }

    #[test]
    fn test_plan_status_terminality() {
        assert!(!PlanStatus::Planned.is_terminal());
        assert!(!PlanStatus::Running.is_terminal());
        assert!(!PlanStatus::Paused.is_terminal());
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = sample_run();
        assert_eq!(run.status, PlanStatus::Planned);
        assert_eq!(run.chunks.len(), 2);
        assert_eq!(run.pending_chunk_ids(), vec![0, 1]);

        let now = ts("2024-01-05T01:00:00Z");
        run.start(now);
        assert_eq!(run.status, PlanStatus::Running);
        assert_eq!(run.started_at, Some(now));
        assert_eq!(run.updated_at, now);

        let later = ts("2024-01-05T02:00:00Z");
        run.chunk_mut(0).unwrap().start(later);
        run.chunk_mut(0).unwrap().complete(1, later);
        run.chunk_mut(1).unwrap().start(later);
        run.chunk_mut(1).unwrap().fail(3, "boom", later);

        assert!(!run.all_chunks_succeeded());
        assert!(run.has_exhausted_failures(3));
        assert!(!run.has_exhausted_failures(4));
        assert!(run.pending_chunk_ids().is_empty());

        run.fail("1 chunk failed", later);
        assert_eq!(run.status, PlanStatus::Failed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_chunk_reset_clears_runtime_fields() {
        let mut run = sample_run();
        let now = ts("2024-01-05T01:00:00Z");
        run.chunk_mut(0).unwrap().start(now);
        run.chunk_mut(0).unwrap().fail(3, "boom", now);

        run.chunk_mut(0).unwrap().reset();
        let chunk = run.chunk(0).unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.attempts, 0);
        assert!(chunk.started_at.is_none());
        assert!(chunk.last_error.is_none());
    }

    #[test]
    fn test_record_force_deduplicates() {
        let mut run = sample_run();
        run.record_force("--force-environment");
        run.record_force("--force-environment");
        assert_eq!(run.forced, vec!["--force-environment"]);
    }

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            PlanStatus::Planned,
            PlanStatus::Running,
            PlanStatus::Paused,
            PlanStatus::Completed,
            PlanStatus::Failed,
            PlanStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
