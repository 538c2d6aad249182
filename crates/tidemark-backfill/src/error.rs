//! Backfill-specific error types.

use crate::plan::PlanId;
use crate::state::PlanStatus;
use std::path::PathBuf;
use thiserror::Error;
use tidemark_core::EnvironmentFingerprint;

/// Errors raised by the backfill engine.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// The requested window failed validation.
    #[error("invalid window: {reason}")]
    InvalidWindow {
        /// Why the window was rejected.
        reason: String,
    },

    /// The window exceeds the configured limit and was not forced.
    #[error(
        "window of {window_hours}h exceeds limit of {limit_hours}h for '{target}'; \
         pass --force-window to plan it anyway"
    )]
    WindowExceedsLimit {
        /// Target object.
        target: String,
        /// Requested window in hours.
        window_hours: i64,
        /// Configured limit in hours.
        limit_hours: u32,
    },

    /// The chunk size is below the configured minimum.
    #[error("chunk size of {chunk_minutes}m is below the minimum of {min_minutes}m")]
    ChunkTooSmall {
        /// Requested chunk size in minutes.
        chunk_minutes: u32,
        /// Configured minimum in minutes.
        min_minutes: u32,
    },

    /// Policy requires an explicit window but a default one was used.
    #[error("policy requires an explicit window for '{target}'; pass --from and --to")]
    ExplicitWindowRequired {
        /// Target object.
        target: String,
    },

    /// The SQL template does not reference the idempotency token.
    #[error(
        "sql template must reference {{token}} when idempotency tokens are required"
    )]
    TokenNotReferenced,

    /// No plan exists with the given id.
    #[error("plan not found: {plan_id}")]
    PlanNotFound {
        /// The missing plan id.
        plan_id: PlanId,
    },

    /// No run exists for the given plan.
    #[error("no run found for plan {plan_id}; start one with `backfill run`")]
    RunNotFound {
        /// The plan id.
        plan_id: PlanId,
    },

    /// A run already exists for the plan.
    #[error(
        "a run already exists for plan {plan_id} (status {status}); \
         use `backfill resume` to continue it"
    )]
    RunAlreadyExists {
        /// The plan id.
        plan_id: PlanId,
        /// Status of the existing run.
        status: PlanStatus,
    },

    /// The run cannot be resumed from its current status.
    #[error("cannot resume run for plan {plan_id} in status {status}")]
    RunNotResumable {
        /// The plan id.
        plan_id: PlanId,
        /// Current run status.
        status: PlanStatus,
    },

    /// The run already reached a terminal status.
    #[error("run for plan {plan_id} is already {status}")]
    RunAlreadyTerminal {
        /// The plan id.
        plan_id: PlanId,
        /// Current run status.
        status: PlanStatus,
    },

    /// The active environment does not match the plan's bound environment.
    #[error(
        "environment mismatch for plan {plan_id}: plan is bound to {bound}, \
         active is {active}; pass --force-environment to override"
    )]
    EnvironmentMismatch {
        /// The plan id.
        plan_id: PlanId,
        /// Fingerprint the plan was created against.
        bound: EnvironmentFingerprint,
        /// Fingerprint of the active configuration.
        active: EnvironmentFingerprint,
    },

    /// The plan is environment-bound but no environment is active.
    #[error(
        "plan {plan_id} is bound to {bound} but no database is configured; \
         pass --force-environment to override"
    )]
    EnvironmentMissing {
        /// The plan id.
        plan_id: PlanId,
        /// Fingerprint the plan was created against.
        bound: EnvironmentFingerprint,
    },

    /// The run's options changed since it was started.
    #[error(
        "options changed since the run began (token {recorded} != {current}); \
         pass --force-compatibility to resume anyway"
    )]
    CompatibilityMismatch {
        /// Token recorded on the run.
        recorded: String,
        /// Token computed from current options.
        current: String,
    },

    /// Another plan's window overlaps this one on the same target.
    #[error(
        "plan {other} overlaps [{from}, {to}) on '{target}'; \
         pass --force-overlap to run anyway"
    )]
    OverlapBlocked {
        /// Target object.
        target: String,
        /// The overlapping plan.
        other: PlanId,
        /// Overlap window start.
        from: String,
        /// Overlap window end.
        to: String,
    },

    /// Another coordinator holds the run lock.
    #[error("run lock for plan {plan_id} is held at {path:?}; is another run in progress?")]
    RunLockHeld {
        /// The plan id.
        plan_id: PlanId,
        /// Lock file path.
        path: PathBuf,
    },

    /// A persisted document could not be read or written.
    ///
    /// Persistence failures are fatal to a run: execution must not continue
    /// once the on-disk state can no longer be updated.
    #[error("state persistence failed at {path:?}: {reason}")]
    Persistence {
        /// Path of the document involved.
        path: PathBuf,
        /// Failure description.
        reason: String,
    },

    /// A persisted document has an unsupported schema version.
    #[error("unsupported state version {found} in {path:?} (supported: {supported})")]
    UnsupportedVersion {
        /// Path of the document.
        path: PathBuf,
        /// Version found on disk.
        found: u32,
        /// Version this build supports.
        supported: u32,
    },
}
