//! Plan building: turning a target and a time window into durable intent.
//!
//! Plans are immutable after creation. The id is derived from the target and
//! window so planning the same window twice is a load, not a second plan, and
//! idempotency tokens come out identical either way.

use crate::chunk::{slice_window, BackfillChunk};
use crate::error::BackfillError;
use crate::options::{BackfillLimits, BackfillOptions, BackfillPolicy, ResolvedBackfill};
use crate::state::PlanStatus;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tidemark_core::EnvironmentFingerprint;

/// Identifier of a plan. Deterministic: `bf-` plus a hash of the target and
/// window, so `plan` has create-or-load semantics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    /// Derive the plan id for a target and window.
    pub fn derive(target: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(target.as_bytes());
        hasher.update(b"|");
        hasher.update(from.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(to.to_rfc3339().as_bytes());
        PlanId(format!("bf-{}", hex::encode(&hasher.finalize()[..6])))
    }

    /// Wrap an id parsed from user input.
    pub fn parse(raw: &str) -> Self {
        PlanId(raw.to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The immutable intent for one backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillPlanState {
    /// Unique plan id.
    pub plan_id: PlanId,
    /// Target object the backfill writes into.
    pub target: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Plan-level lifecycle status. Superseded by the run once one exists.
    pub status: PlanStatus,
    /// Overall window start, inclusive.
    pub from: DateTime<Utc>,
    /// Overall window end, exclusive.
    pub to: DateTime<Utc>,
    /// Ordered chunks covering `[from, to)`.
    pub chunks: Vec<BackfillChunk>,
    /// Resolved execution options.
    pub options: BackfillOptions,
    /// Resolved policy.
    pub policy: BackfillPolicy,
    /// Resolved limits.
    pub limits: BackfillLimits,
    /// Environment the plan was created against, when a live database
    /// configuration was available. Absent for offline plans, which are
    /// accepted against any environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentFingerprint>,
}

impl BackfillPlanState {
    /// Window length in whole hours, rounding up partial hours.
    pub fn window_hours(&self) -> i64 {
        let minutes = (self.to - self.from).num_minutes();
        (minutes + 59) / 60
    }

    /// Whether this plan's window overlaps another half-open window.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.from < to && from < self.to
    }
}

/// Builds a validated, chunked plan.
pub struct PlanBuilder<'a> {
    target: String,
    resolved: &'a ResolvedBackfill,
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    window_explicit: bool,
    chunk_hours: Option<u32>,
    time_column: Option<String>,
    sql_template: String,
    force_window: bool,
    environment: Option<EnvironmentFingerprint>,
    now: Option<DateTime<Utc>>,
}

impl<'a> PlanBuilder<'a> {
    /// Start building a plan for a target with resolved configuration.
    pub fn new(target: impl Into<String>, resolved: &'a ResolvedBackfill) -> Self {
        Self {
            target: target.into(),
            resolved,
            window: None,
            window_explicit: false,
            chunk_hours: None,
            time_column: None,
            sql_template: String::new(),
            force_window: false,
            environment: None,
            now: None,
        }
    }

    /// Set the backfill window. `explicit` records whether the caller named
    /// the window or fell back to a default one.
    pub fn window(mut self, from: DateTime<Utc>, to: DateTime<Utc>, explicit: bool) -> Self {
        self.window = Some((from, to));
        self.window_explicit = explicit;
        self
    }

    /// Override the chunk size.
    pub fn chunk_hours(mut self, hours: u32) -> Self {
        self.chunk_hours = Some(hours);
        self
    }

    /// Override the time column.
    pub fn time_column(mut self, column: impl Into<String>) -> Self {
        self.time_column = Some(column.into());
        self
    }

    /// Set the caller-supplied SQL template.
    pub fn sql_template(mut self, template: impl Into<String>) -> Self {
        self.sql_template = template.into();
        self
    }

    /// Allow a window larger than `limits.max_window_hours`.
    pub fn force_window(mut self, force: bool) -> Self {
        self.force_window = force;
        self
    }

    /// Bind the plan to a live environment.
    pub fn environment(mut self, env: Option<EnvironmentFingerprint>) -> Self {
        self.environment = env;
        self
    }

    /// Fix the creation timestamp. Tests use this; the default is `Utc::now()`.
    pub fn created_at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Validate the inputs and produce the plan.
    pub fn build(self) -> Result<BackfillPlanState, BackfillError> {
        let now = self.now.unwrap_or_else(Utc::now);
        let options = BackfillOptions {
            chunk_hours: self.chunk_hours.unwrap_or(self.resolved.options.chunk_hours),
            time_column: self
                .time_column
                .unwrap_or_else(|| self.resolved.options.time_column.clone()),
            ..self.resolved.options.clone()
        };
        let policy = self.resolved.policy.clone();
        let limits = self.resolved.limits.clone();

        let (from, to) = match self.window {
            Some(window) => window,
            None => {
                // Default window: the 24 hours preceding the current hour.
                let end = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                (end - Duration::hours(24), end)
            }
        };

        if from >= to {
            return Err(BackfillError::InvalidWindow {
                reason: format!("from {} is not before to {}", from.to_rfc3339(), to.to_rfc3339()),
            });
        }

        if policy.require_explicit_window && !self.window_explicit {
            return Err(BackfillError::ExplicitWindowRequired {
                target: self.target,
            });
        }

        let window_hours = {
            let minutes = (to - from).num_minutes();
            (minutes + 59) / 60
        };
        if window_hours > i64::from(limits.max_window_hours) && !self.force_window {
            return Err(BackfillError::WindowExceedsLimit {
                target: self.target,
                window_hours,
                limit_hours: limits.max_window_hours,
            });
        }

        let chunk_minutes = options.chunk_hours.saturating_mul(60);
        if chunk_minutes < limits.min_chunk_minutes {
            return Err(BackfillError::ChunkTooSmall {
                chunk_minutes,
                min_minutes: limits.min_chunk_minutes,
            });
        }

        if options.require_idempotency_token && !self.sql_template.contains("{token}") {
            return Err(BackfillError::TokenNotReferenced);
        }

        let plan_id = PlanId::derive(&self.target, from, to);
        let chunks = slice_window(plan_id.as_str(), from, to, options.chunk_hours, &self.sql_template);

        tracing::debug!(
            plan_id = %plan_id,
            target = %self.target,
            chunks = chunks.len(),
            "built backfill plan"
        );

        Ok(BackfillPlanState {
            plan_id,
            target: self.target,
            created_at: now,
            status: PlanStatus::Planned,
            from,
            to,
            chunks,
            options,
            policy,
            limits,
            environment: self.environment,
        })
    }
}
