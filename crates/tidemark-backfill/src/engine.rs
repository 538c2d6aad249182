//! The engine facade.
//!
//! Ties the store, the resolved configuration, the active environment, and
//! the SQL executor together behind the operations the CLI exposes.

use crate::coordinator::{ExecuteOptions, ExecutionCoordinator};
use crate::doctor::{diagnose, DoctorReport};
use crate::error::BackfillError;
use crate::event::{BackfillEvent, EventKind};
use crate::gate;
use crate::options::ResolvedBackfill;
use crate::plan::{BackfillPlanState, PlanBuilder, PlanId};
use crate::state::BackfillRunState;
use crate::status::{summarize, BackfillStatusSummary};
use crate::store::{CancelMode, StateStore};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tidemark_core::{CheckFinding, EnvironmentFingerprint, SqlExecutor};

/// Inputs for building a plan.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Target object.
    pub target: String,
    /// Explicit window, when the caller supplied one.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Chunk size override.
    pub chunk_hours: Option<u32>,
    /// Time column override.
    pub time_column: Option<String>,
    /// Caller-supplied SQL template.
    pub sql_template: String,
    /// Allow a window larger than the configured limit.
    pub force_window: bool,
}

/// Result of `plan`: the plan, where it lives, and whether it already existed.
#[derive(Debug)]
pub struct PlanOutcome {
    /// The plan (freshly built, or loaded when one already existed).
    pub plan: BackfillPlanState,
    /// Path of the persisted plan document.
    pub path: PathBuf,
    /// Whether a plan with this id already existed.
    pub already_existed: bool,
}

/// Result of `cancel`.
#[derive(Debug)]
pub enum CancelOutcome {
    /// A live coordinator holds the run; it was signalled and will stop
    /// after in-flight chunk attempts finish.
    Signalled,
    /// No coordinator was active; the run record was updated directly.
    Applied(BackfillRunState),
}

/// The backfill engine.
pub struct BackfillEngine {
    store: StateStore,
    resolved: ResolvedBackfill,
    environment: Option<EnvironmentFingerprint>,
    executor: Arc<dyn SqlExecutor>,
}

impl BackfillEngine {
    /// Create an engine.
    pub fn new(
        store: StateStore,
        resolved: ResolvedBackfill,
        environment: Option<EnvironmentFingerprint>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        Self {
            store,
            resolved,
            environment,
            executor,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The resolved configuration.
    pub fn resolved(&self) -> &ResolvedBackfill {
        &self.resolved
    }

    /// Build and persist a plan, or load the existing one for the same
    /// target and window.
    pub fn plan(&self, req: PlanRequest) -> Result<PlanOutcome, BackfillError> {
        let mut builder = PlanBuilder::new(req.target.as_str(), &self.resolved)
            .sql_template(req.sql_template.as_str())
            .force_window(req.force_window)
            .environment(self.environment.clone());
        if let Some((from, to)) = req.window {
            builder = builder.window(from, to, true);
        }
        if let Some(hours) = req.chunk_hours {
            builder = builder.chunk_hours(hours);
        }
        if let Some(column) = req.time_column {
            builder = builder.time_column(column);
        }

        let plan = builder.build()?;

        if self.store.plan_exists(&plan.plan_id) {
            let existing = self.store.load_plan(&plan.plan_id)?;
            let path = self.store.plan_path(&existing.plan_id);
            tracing::info!(plan_id = %existing.plan_id, "plan already exists; loaded");
            return Ok(PlanOutcome {
                plan: existing,
                path,
                already_existed: true,
            });
        }

        let path = self.store.save_plan(&plan)?;
        tracing::info!(plan_id = %plan.plan_id, chunks = plan.chunks.len(), "plan created");
        Ok(PlanOutcome {
            plan,
            path,
            already_existed: false,
        })
    }

    /// The coordinator for this engine's store and environment.
    pub fn coordinator(&self) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            self.store.clone(),
            Arc::clone(&self.executor),
            self.environment.clone(),
        )
    }

    /// Start a fresh run.
    pub async fn run(
        &self,
        plan_id: &PlanId,
        opts: ExecuteOptions,
    ) -> Result<BackfillRunState, BackfillError> {
        self.coordinator().run(plan_id, opts).await
    }

    /// Resume an existing run.
    pub async fn resume(
        &self,
        plan_id: &PlanId,
        opts: ExecuteOptions,
    ) -> Result<BackfillRunState, BackfillError> {
        self.coordinator().resume(plan_id, opts).await
    }

    /// Recompute the status summary for a plan's run.
    pub fn status(&self, plan_id: &PlanId) -> Result<BackfillStatusSummary, BackfillError> {
        let run = self.store.load_run(plan_id)?;
        Ok(summarize(&run, &self.store))
    }

    /// Diagnose a plan's run.
    pub fn doctor(&self, plan_id: &PlanId) -> Result<DoctorReport, BackfillError> {
        let plan = self.store.load_plan(plan_id)?;
        let run = self.store.load_run(plan_id)?;
        Ok(diagnose(&plan, &run, &self.store, Utc::now()))
    }

    /// Cancel (or pause) a run.
    ///
    /// If a coordinator is live, a marker signals it to stop dispatching;
    /// in-flight chunk attempts finish first. Otherwise the run record is
    /// updated directly.
    pub fn cancel(&self, plan_id: &PlanId, pause: bool) -> Result<CancelOutcome, BackfillError> {
        let mut run = self.store.load_run(plan_id)?;
        if run.status.is_terminal() {
            return Err(BackfillError::RunAlreadyTerminal {
                plan_id: plan_id.clone(),
                status: run.status,
            });
        }

        let mode = if pause {
            CancelMode::Pause
        } else {
            CancelMode::Cancel
        };

        if self.store.run_lock_present(plan_id) {
            self.store.request_cancel(plan_id, mode)?;
            tracing::info!(plan_id = %plan_id, ?mode, "stop requested; coordinator will drain");
            return Ok(CancelOutcome::Signalled);
        }

        let now = Utc::now();
        let kind = match mode {
            CancelMode::Cancel => {
                run.cancel(now);
                EventKind::RunCancelled
            }
            CancelMode::Pause => {
                run.pause(now);
                EventKind::RunPaused
            }
        };
        self.store.save_run(&run)?;
        self.store
            .append_event(plan_id, &BackfillEvent::run(kind, now))?;
        tracing::info!(plan_id = %plan_id, status = %run.status, "run stopped");
        Ok(CancelOutcome::Applied(run))
    }

    /// Evaluate the policy gate over all persisted state.
    pub fn check(&self) -> Result<Vec<CheckFinding>, BackfillError> {
        gate::evaluate(&self.store, &self.resolved)
    }
}
