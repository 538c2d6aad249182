//! Backfill engine for Tidemark.
//!
//! This crate implements the `backfill` plugin: planning, chunking,
//! executing, checkpointing, retrying, and resuming long-running
//! time-windowed data backfills against a live analytical database.
//!
//! - A **plan** is the immutable intent: a target, a `[from, to)` window
//!   sliced into chunks, resolved options/policy/limits, and (when created
//!   against a live configuration) an environment fingerprint.
//! - A **run** is the mutable record of one execution attempt, checkpointed
//!   to disk on every transition so a crashed coordinator can resume.
//! - The **coordinator** dispatches chunks with bounded concurrency, retries
//!   failures in place, and never makes a dispatch decision ahead of the
//!   durable checkpoint of the previous outcome.
//! - The **policy gate** turns persisted state plus policy into structured
//!   findings for the host's preflight check.
//!
//! # Example
//!
//! ```ignore
//! use tidemark_backfill::{BackfillEngine, PlanRequest, ExecuteOptions};
//!
//! let engine = BackfillEngine::new(store, resolved, environment, executor);
//! let outcome = engine.plan(PlanRequest { /* target, window, sql, ... */ })?;
//! let run = engine.run(&outcome.plan.plan_id, ExecuteOptions::default()).await?;
//! println!("{}", engine.status(&outcome.plan.plan_id)?.status);
//! ```

pub mod chunk;
pub mod coordinator;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod event;
pub mod gate;
pub mod guard;
pub mod options;
pub mod plan;
pub mod plugin;
pub mod state;
pub mod status;
pub mod store;

// Chunk types
pub use chunk::{idempotency_token, slice_window, BackfillChunk};

// Coordinator types
pub use coordinator::{CancelHandle, ExecuteOptions, ExecutionCoordinator, FaultInjection};

// Doctor types
pub use doctor::{diagnose, DoctorIssue, DoctorReport, IssueCode};

// Engine types
pub use engine::{BackfillEngine, CancelOutcome, PlanOutcome, PlanRequest};

// Error types
pub use error::BackfillError;

// Event types
pub use event::{BackfillEvent, EventKind};

// Option types
pub use options::{
    BackfillConfigFile, BackfillLimits, BackfillOptions, BackfillPolicy, ResolvedBackfill,
};

// Plan types
pub use plan::{BackfillPlanState, PlanBuilder, PlanId};

// Plugin types
pub use plugin::{BackfillPlugin, PLUGIN_NAME};

// State types
pub use state::{BackfillRunChunkState, BackfillRunState, ChunkStatus, PlanStatus};

// Status types
pub use status::{summarize, BackfillStatusSummary, ChunkCounts};

// Store types
pub use store::{CancelMode, RunLock, StateStore, STATE_VERSION};
