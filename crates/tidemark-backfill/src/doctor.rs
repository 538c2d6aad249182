//! Run diagnosis.
//!
//! `doctor` classifies a plan/run into issue codes and proposes recovery
//! actions. It never mutates state; every recommendation is for an operator
//! to apply.

use crate::plan::BackfillPlanState;
use crate::state::{BackfillRunState, ChunkStatus, PlanStatus};
use crate::store::StateStore;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Stable issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    /// A chunk has been `running` past the staleness threshold; the
    /// coordinator likely crashed mid-chunk.
    ChunkStuckRunning,
    /// A chunk failed with its retries exhausted.
    ChunkRetryExhausted,
    /// The run as a whole is `failed`.
    RunFailed,
    /// The run is `running` but its state has not changed within the
    /// staleness threshold.
    RunStalled,
    /// A run lock file exists but the run is not progressing; a crashed
    /// coordinator likely left it behind.
    RunLockPresent,
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueCode::ChunkStuckRunning => write!(f, "chunk_stuck_running"),
            IssueCode::ChunkRetryExhausted => write!(f, "chunk_retry_exhausted"),
            IssueCode::RunFailed => write!(f, "run_failed"),
            IssueCode::RunStalled => write!(f, "run_stalled"),
            IssueCode::RunLockPresent => write!(f, "run_lock_present"),
        }
    }
}

/// One diagnosed issue.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorIssue {
    /// Stable issue code.
    pub code: IssueCode,
    /// Human-readable description.
    pub message: String,
    /// Chunk involved, for chunk-level issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
}

/// The full diagnosis for one plan.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    /// Plan under diagnosis.
    pub plan_id: String,
    /// Issues found, in severity order.
    pub issues: Vec<DoctorIssue>,
    /// Recovery actions an operator can take.
    pub recommendations: Vec<String>,
}

impl DoctorReport {
    /// Whether the diagnosis found nothing wrong.
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Diagnose a run against its plan.
pub fn diagnose(
    plan: &BackfillPlanState,
    run: &BackfillRunState,
    store: &StateStore,
    now: DateTime<Utc>,
) -> DoctorReport {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    let stale_after = Duration::minutes(plan.limits.stuck_chunk_minutes);

    for chunk in &run.chunks {
        match chunk.status {
            ChunkStatus::Running => {
                let stuck = chunk
                    .started_at
                    .map(|started| now - started > stale_after)
                    .unwrap_or(true);
                if stuck {
                    issues.push(DoctorIssue {
                        code: IssueCode::ChunkStuckRunning,
                        message: format!(
                            "chunk {} has been running since {}",
                            chunk.id,
                            chunk
                                .started_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "an unknown time".to_string()),
                        ),
                        chunk_id: Some(chunk.id),
                    });
                    recommendations.push(format!(
                        "chunk {}: if no coordinator is alive, `backfill resume {}` will re-dispatch it",
                        chunk.id, run.plan_id,
                    ));
                }
            }
            ChunkStatus::Failed => {
                if chunk.attempts >= plan.options.max_retries_per_chunk {
                    issues.push(DoctorIssue {
                        code: IssueCode::ChunkRetryExhausted,
                        message: format!(
                            "chunk {} failed after {} attempts: {}",
                            chunk.id,
                            chunk.attempts,
                            chunk.last_error.as_deref().unwrap_or("unknown error"),
                        ),
                        chunk_id: Some(chunk.id),
                    });
                    recommendations.push(format!(
                        "investigate chunk {}'s last error, then resume with --replay-failed",
                        chunk.id,
                    ));
                }
            }
            _ => {}
        }
    }

    if run.status == PlanStatus::Failed {
        issues.push(DoctorIssue {
            code: IssueCode::RunFailed,
            message: format!(
                "run failed: {}",
                run.last_error.as_deref().unwrap_or("unknown error"),
            ),
            chunk_id: None,
        });
    }

    if run.status == PlanStatus::Running && now - run.updated_at > stale_after {
        issues.push(DoctorIssue {
            code: IssueCode::RunStalled,
            message: format!(
                "run is marked running but has not progressed since {}",
                run.updated_at.to_rfc3339(),
            ),
            chunk_id: None,
        });
        if store.run_lock_present(&run.plan_id) {
            issues.push(DoctorIssue {
                code: IssueCode::RunLockPresent,
                message: "a run lock exists; a crashed coordinator may have left it behind"
                    .to_string(),
                chunk_id: None,
            });
            recommendations.push(format!(
                "verify no coordinator process is alive, remove {}, then `backfill resume {}`",
                store.run_path(&run.plan_id).with_extension("lock").display(),
                run.plan_id,
            ));
        }
    }

    recommendations.dedup();

    DoctorReport {
        plan_id: run.plan_id.to_string(),
        issues,
        recommendations,
    }
}
