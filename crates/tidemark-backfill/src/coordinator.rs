//! The execution coordinator.
//!
//! One coordinating task drives chunk execution: it dispatches workers in
//! plan order with concurrency bounded by `max_parallel_chunks`, applies each
//! outcome to the run state, and durably checkpoints the run before the next
//! dispatch decision. Persistence is the ordering barrier; chunks may finish
//! in any order, but the on-disk run is always one consistent snapshot.

use crate::error::BackfillError;
use crate::event::{BackfillEvent, EventKind};
use crate::guard::{check_compatibility, check_environment};
use crate::plan::{BackfillPlanState, PlanId};
use crate::state::{BackfillRunState, ChunkStatus, PlanStatus};
use crate::store::{CancelMode, RunLock, StateStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidemark_core::{EnvironmentFingerprint, SqlExecutor};
use tokio::task::JoinSet;

/// Delay between execution attempts of one chunk.
const RETRY_DELAY_MS: u64 = 200;

/// Forces a designated chunk to fail for a bounded number of attempts.
///
/// Exists to make the retry/resume state machine deterministically testable
/// without real database fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInjection {
    /// Chunk to fail.
    pub fail_chunk_id: u32,
    /// Number of attempts that fail before the chunk is allowed to succeed.
    pub fail_count: u32,
}

/// Execution options for `run`/`resume`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Re-execute chunks already `done`.
    pub replay_done: bool,
    /// Re-execute chunks already `failed`.
    pub replay_failed: bool,
    /// Mark chunks already `failed` as `skipped` instead of re-executing
    /// them, letting the run complete without them.
    pub skip_failed: bool,
    /// Start despite an overlapping plan on the same target.
    pub force_overlap: bool,
    /// Run despite an environment fingerprint mismatch.
    pub force_environment: bool,
    /// Resume despite a compatibility token mismatch.
    pub force_compatibility: bool,
    /// Simulated fault, for tests.
    pub fault: Option<FaultInjection>,
}

impl ExecuteOptions {
    fn forced_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.force_overlap {
            flags.push("--force-overlap");
        }
        if self.force_environment {
            flags.push("--force-environment");
        }
        if self.force_compatibility {
            flags.push("--force-compatibility");
        }
        flags
    }
}

/// In-process cancellation handle. The CLI's cross-process path goes through
/// the store's cancel marker instead.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a fresh handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop after in-flight attempts finish.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct FaultState {
    fail_chunk_id: u32,
    remaining: Mutex<u32>,
}

impl FaultState {
    fn new(fault: FaultInjection) -> Self {
        Self {
            fail_chunk_id: fault.fail_chunk_id,
            remaining: Mutex::new(fault.fail_count),
        }
    }

    /// Consume one injected failure for the chunk, if any remain.
    fn take_failure(&self, chunk_id: u32) -> bool {
        if chunk_id != self.fail_chunk_id {
            return false;
        }
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

/// Terminal outcome of one chunk's worker.
#[derive(Debug)]
struct ChunkOutcome {
    chunk_id: u32,
    attempts: u32,
    error: Option<String>,
}

/// Drives chunk execution for one plan at a time.
pub struct ExecutionCoordinator {
    store: StateStore,
    executor: Arc<dyn SqlExecutor>,
    environment: Option<EnvironmentFingerprint>,
    cancel: CancelHandle,
}

impl ExecutionCoordinator {
    /// Create a coordinator over a state store and an executor.
    pub fn new(
        store: StateStore,
        executor: Arc<dyn SqlExecutor>,
        environment: Option<EnvironmentFingerprint>,
    ) -> Self {
        Self {
            store,
            executor,
            environment,
            cancel: CancelHandle::new(),
        }
    }

    /// Handle for cancelling an in-process run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Start a fresh run of a plan.
    pub async fn run(
        &self,
        plan_id: &PlanId,
        opts: ExecuteOptions,
    ) -> Result<BackfillRunState, BackfillError> {
        let plan = self.store.load_plan(plan_id)?;
        check_environment(&plan, self.environment.as_ref(), opts.force_environment)?;
        self.check_overlap(&plan, opts.force_overlap)?;

        if let Some(existing) = self.store.try_load_run(plan_id)? {
            return Err(BackfillError::RunAlreadyExists {
                plan_id: plan_id.clone(),
                status: existing.status,
            });
        }

        let lock = self.store.acquire_run_lock(plan_id)?;

        let now = Utc::now();
        let mut run = BackfillRunState::new(&plan, now);
        for flag in opts.forced_flags() {
            run.record_force(flag);
            self.store.append_event(
                plan_id,
                &BackfillEvent::run(EventKind::ForceApplied, now).with_message(flag),
            )?;
        }
        run.start(now);
        self.store.save_run(&run)?;
        self.store
            .append_event(plan_id, &BackfillEvent::run(EventKind::RunStarted, now))?;
        tracing::info!(plan_id = %plan_id, chunks = run.chunks.len(), "backfill run started");

        self.drive(&plan, run, opts, lock).await
    }

    /// Resume an existing run, merging run state with the plan.
    pub async fn resume(
        &self,
        plan_id: &PlanId,
        opts: ExecuteOptions,
    ) -> Result<BackfillRunState, BackfillError> {
        let plan = self.store.load_plan(plan_id)?;
        check_environment(&plan, self.environment.as_ref(), opts.force_environment)?;

        let mut run = self.store.load_run(plan_id)?;
        check_compatibility(&run, &plan.options, opts.force_compatibility)?;

        if run.status.is_terminal()
            && !(opts.replay_done || opts.replay_failed || opts.skip_failed)
        {
            return Err(BackfillError::RunNotResumable {
                plan_id: plan_id.clone(),
                status: run.status,
            });
        }

        let lock = self.store.acquire_run_lock(plan_id)?;

        let now = Utc::now();

        // Chunks left `running` by a crashed coordinator never reached a
        // terminal attempt state; they are re-dispatched.
        for chunk in &mut run.chunks {
            if chunk.status == ChunkStatus::Running {
                tracing::warn!(
                    plan_id = %plan_id,
                    chunk_id = chunk.id,
                    "chunk was left running by a previous coordinator; re-dispatching"
                );
                chunk.reset();
            }
        }

        // Replay decisions reset targeted chunks to pending with a fresh
        // retry budget; the event log keeps the prior attempts.
        if opts.replay_done {
            run.replay_done = true;
            self.replay_chunks(&mut run, ChunkStatus::Done, now)?;
        }
        if opts.replay_failed {
            run.replay_failed = true;
            self.replay_chunks(&mut run, ChunkStatus::Failed, now)?;
        }
        if opts.skip_failed {
            let ids: Vec<u32> = run
                .chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Failed)
                .map(|c| c.id)
                .collect();
            for id in ids {
                if let Some(chunk) = run.chunk_mut(id) {
                    chunk.skip(now);
                }
                self.store.append_event(
                    plan_id,
                    &BackfillEvent::chunk(EventKind::ChunkSkipped, id, now),
                )?;
            }
        }

        for flag in opts.forced_flags() {
            run.record_force(flag);
            self.store.append_event(
                plan_id,
                &BackfillEvent::run(EventKind::ForceApplied, now).with_message(flag),
            )?;
        }

        run.start(now);
        self.store.save_run(&run)?;
        self.store
            .append_event(plan_id, &BackfillEvent::run(EventKind::RunResumed, now))?;
        tracing::info!(
            plan_id = %plan_id,
            pending = run.pending_chunk_ids().len(),
            "backfill run resumed"
        );

        self.drive(&plan, run, opts, lock).await
    }

    fn replay_chunks(
        &self,
        run: &mut BackfillRunState,
        status: ChunkStatus,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), BackfillError> {
        let ids: Vec<u32> = run
            .chunks
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.id)
            .collect();
        for id in ids {
            if let Some(chunk) = run.chunk_mut(id) {
                chunk.reset();
            }
            self.store.append_event(
                &run.plan_id,
                &BackfillEvent::chunk(EventKind::ChunkReplayed, id, now)
                    .with_message(format!("was {}", status)),
            )?;
        }
        Ok(())
    }

    /// Refuse to start while another plan touches an overlapping window on
    /// the same target (unless forced). Plans whose runs completed or were
    /// cancelled no longer block.
    fn check_overlap(
        &self,
        plan: &BackfillPlanState,
        force: bool,
    ) -> Result<(), BackfillError> {
        if !plan.policy.block_overlapping_runs || force {
            return Ok(());
        }
        for other in self.store.list_plans()? {
            if other.plan_id == plan.plan_id
                || other.target != plan.target
                || !other.overlaps(plan.from, plan.to)
            {
                continue;
            }
            let blocks = match self.store.try_load_run(&other.plan_id)? {
                Some(run) => !matches!(run.status, PlanStatus::Completed | PlanStatus::Cancelled),
                None => true,
            };
            if blocks {
                let from = plan.from.max(other.from);
                let to = plan.to.min(other.to);
                return Err(BackfillError::OverlapBlocked {
                    target: plan.target.clone(),
                    other: other.plan_id,
                    from: from.to_rfc3339(),
                    to: to.to_rfc3339(),
                });
            }
        }
        Ok(())
    }

    /// The dispatch loop. Holds the run lock for its whole duration.
    async fn drive(
        &self,
        plan: &BackfillPlanState,
        mut run: BackfillRunState,
        opts: ExecuteOptions,
        _lock: RunLock,
    ) -> Result<BackfillRunState, BackfillError> {
        let fault = opts.fault.map(|f| Arc::new(FaultState::new(f)));
        let max_parallel = plan.options.max_parallel_chunks;
        let max_retries = plan.options.max_retries_per_chunk;

        let mut queue: VecDeque<u32> = run.pending_chunk_ids().into();
        let mut workers: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut stop: Option<CancelMode> = None;

        loop {
            if stop.is_none() {
                stop = self.stop_requested(&run.plan_id);
            }

            // Dispatch in plan order while a slot is free.
            while stop.is_none() && workers.len() < max_parallel {
                let Some(chunk_id) = queue.pop_front() else {
                    break;
                };
                let Some(plan_chunk) = plan.chunks.iter().find(|c| c.id == chunk_id) else {
                    tracing::error!(chunk_id, "run chunk has no plan chunk; skipping");
                    continue;
                };
                let now = Utc::now();
                if let Some(chunk) = run.chunk_mut(chunk_id) {
                    chunk.start(now);
                }
                run.touch(now);
                self.store.save_run(&run)?;
                self.store.append_event(
                    &run.plan_id,
                    &BackfillEvent::chunk(EventKind::ChunkStarted, chunk_id, now),
                )?;

                let statement =
                    plan_chunk.render_statement(&plan.target, &plan.options.time_column);
                let executor = Arc::clone(&self.executor);
                let fault = fault.clone();
                workers.spawn(async move {
                    execute_chunk(executor, chunk_id, statement, max_retries, fault).await
                });
            }

            // Nothing in flight and nothing dispatchable: the run is over.
            let Some(joined) = workers.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A worker panic is an execution failure, not a crash of
                    // the whole run.
                    tracing::error!(error = %e, "chunk worker panicked");
                    continue;
                }
            };

            // Checkpoint the outcome before any further dispatch decision.
            // This is the resumability guarantee: the on-disk run always
            // reflects every chunk that reached a terminal attempt state.
            self.apply_outcome(&mut run, outcome)?;
        }

        self.finalize(&mut run, stop)?;
        Ok(run)
    }

    fn stop_requested(&self, plan_id: &PlanId) -> Option<CancelMode> {
        if self.cancel.is_requested() {
            return Some(CancelMode::Cancel);
        }
        self.store.cancel_requested(plan_id)
    }

    fn apply_outcome(
        &self,
        run: &mut BackfillRunState,
        outcome: ChunkOutcome,
    ) -> Result<(), BackfillError> {
        let now = Utc::now();
        let event = match outcome.error {
            None => {
                if let Some(chunk) = run.chunk_mut(outcome.chunk_id) {
                    chunk.complete(outcome.attempts, now);
                }
                tracing::info!(
                    plan_id = %run.plan_id,
                    chunk_id = outcome.chunk_id,
                    attempts = outcome.attempts,
                    "chunk done"
                );
                BackfillEvent::chunk(EventKind::ChunkDone, outcome.chunk_id, now)
                    .with_attempts(outcome.attempts)
            }
            Some(error) => {
                if let Some(chunk) = run.chunk_mut(outcome.chunk_id) {
                    chunk.fail(outcome.attempts, error.clone(), now);
                }
                tracing::warn!(
                    plan_id = %run.plan_id,
                    chunk_id = outcome.chunk_id,
                    attempts = outcome.attempts,
                    error = %error,
                    "chunk failed"
                );
                BackfillEvent::chunk(EventKind::ChunkFailed, outcome.chunk_id, now)
                    .with_attempts(outcome.attempts)
                    .with_message(error)
            }
        };
        run.touch(now);
        self.store.save_run(run)?;
        self.store.append_event(&run.plan_id, &event)?;
        Ok(())
    }

    fn finalize(
        &self,
        run: &mut BackfillRunState,
        stop: Option<CancelMode>,
    ) -> Result<(), BackfillError> {
        let now = Utc::now();
        // A stop request that arrives after the last chunk finished changes
        // nothing; the truthful record is completion.
        let kind = if run.all_chunks_succeeded() {
            run.complete(now);
            EventKind::RunCompleted
        } else {
            match stop {
                Some(CancelMode::Cancel) => {
                    run.cancel(now);
                    EventKind::RunCancelled
                }
                Some(CancelMode::Pause) => {
                    run.pause(now);
                    EventKind::RunPaused
                }
                None => {
                    let failed = run
                        .chunks
                        .iter()
                        .filter(|c| c.status == ChunkStatus::Failed)
                        .count();
                    let message = if failed > 0 {
                        format!("{} chunk(s) failed", failed)
                    } else {
                        "run ended with unfinished chunks".to_string()
                    };
                    run.fail(message, now);
                    EventKind::RunFailed
                }
            }
        };
        self.store.save_run(run)?;
        self.store
            .append_event(&run.plan_id, &BackfillEvent::run(kind, now))?;
        self.store.clear_cancel(&run.plan_id);
        tracing::info!(plan_id = %run.plan_id, status = %run.status, "backfill run finished");
        Ok(())
    }
}

/// Execute one chunk's statement, retrying in place up to `max_retries`
/// attempts. Returns the terminal outcome; never touches the store.
async fn execute_chunk(
    executor: Arc<dyn SqlExecutor>,
    chunk_id: u32,
    statement: String,
    max_retries: u32,
    fault: Option<Arc<FaultState>>,
) -> ChunkOutcome {
    let mut attempts = 0u32;
    let mut last_error = String::new();

    while attempts < max_retries {
        attempts += 1;

        let injected = fault
            .as_ref()
            .is_some_and(|f| f.take_failure(chunk_id));
        let result = if injected {
            Err(tidemark_core::SqlError::Retryable(
                "injected fault".to_string(),
            ))
        } else {
            executor.execute(&statement).await.map(|_| ())
        };

        match result {
            Ok(()) => {
                return ChunkOutcome {
                    chunk_id,
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::debug!(chunk_id, attempts, error = %last_error, "chunk attempt failed");
                if e.is_fatal() {
                    break;
                }
                if attempts < max_retries {
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                }
            }
        }
    }

    ChunkOutcome {
        chunk_id,
        attempts,
        error: Some(last_error),
    }
}
