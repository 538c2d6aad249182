//! Resolved backfill configuration: options, policy, and limits.
//!
//! The config file carries optional fields; normalization happens exactly
//! once, here, so the planner and coordinator only ever see fully-populated
//! structs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default chunk size in hours.
pub const DEFAULT_CHUNK_HOURS: u32 = 24;

/// Default bound on concurrently executing chunks.
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 2;

/// Default maximum execution attempts per chunk.
pub const DEFAULT_MAX_RETRIES_PER_CHUNK: u32 = 3;

/// Default time column a chunk's window predicates against.
pub const DEFAULT_TIME_COLUMN: &str = "event_time";

/// Default ceiling on a plan's overall window, in hours (30 days).
pub const DEFAULT_MAX_WINDOW_HOURS: u32 = 720;

/// Default floor on chunk size, in minutes.
pub const DEFAULT_MIN_CHUNK_MINUTES: u32 = 15;

/// Default staleness threshold for a chunk stuck in `running`, in minutes.
pub const DEFAULT_STUCK_CHUNK_MINUTES: i64 = 30;

/// Resolved execution options for one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillOptions {
    /// Chunk size in hours.
    pub chunk_hours: u32,
    /// Maximum chunks executing concurrently.
    pub max_parallel_chunks: usize,
    /// Maximum execution attempts per chunk (counting the successful one).
    pub max_retries_per_chunk: u32,
    /// Whether the SQL template must reference the chunk's idempotency token.
    pub require_idempotency_token: bool,
    /// Time column the chunk window predicates against.
    pub time_column: String,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            chunk_hours: DEFAULT_CHUNK_HOURS,
            max_parallel_chunks: DEFAULT_MAX_PARALLEL_CHUNKS,
            max_retries_per_chunk: DEFAULT_MAX_RETRIES_PER_CHUNK,
            require_idempotency_token: true,
            time_column: DEFAULT_TIME_COLUMN.to_string(),
        }
    }
}

impl BackfillOptions {
    /// Token detecting option drift across a resume. Any change to a field
    /// that alters chunking or retry semantics yields a different token.
    pub fn compatibility_token(&self) -> String {
        let canonical = format!(
            "chunk_hours={};max_parallel_chunks={};max_retries_per_chunk={};\
             require_idempotency_token={};time_column={}",
            self.chunk_hours,
            self.max_parallel_chunks,
            self.max_retries_per_chunk,
            self.require_idempotency_token,
            self.time_column,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Resolved policy for one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPolicy {
    /// Reject plans built from a default window.
    pub require_explicit_window: bool,
    /// Refuse to start a run while another plan overlaps its window.
    pub block_overlapping_runs: bool,
    /// Targets that must carry a completed backfill before a schema change
    /// ships. Evaluated by the policy gate.
    pub required_targets: Vec<String>,
}

impl Default for BackfillPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

impl BackfillPolicy {
    /// The strict baseline policy. Relaxing any of these fields is surfaced
    /// by the policy gate as `backfill_policy_relaxed`.
    pub fn strict() -> Self {
        Self {
            require_explicit_window: true,
            block_overlapping_runs: true,
            required_targets: Vec::new(),
        }
    }

    /// Fields of this policy that are weaker than the strict baseline.
    pub fn relaxed_fields(&self) -> Vec<&'static str> {
        let mut relaxed = Vec::new();
        if !self.require_explicit_window {
            relaxed.push("require_explicit_window");
        }
        if !self.block_overlapping_runs {
            relaxed.push("block_overlapping_runs");
        }
        relaxed
    }
}

/// Resolved limits for one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillLimits {
    /// Ceiling on a plan's overall window, in hours.
    pub max_window_hours: u32,
    /// Floor on chunk size, in minutes.
    pub min_chunk_minutes: u32,
    /// Minutes after which a `running` chunk is considered stuck.
    pub stuck_chunk_minutes: i64,
}

impl Default for BackfillLimits {
    fn default() -> Self {
        Self {
            max_window_hours: DEFAULT_MAX_WINDOW_HOURS,
            min_chunk_minutes: DEFAULT_MIN_CHUNK_MINUTES,
            stuck_chunk_minutes: DEFAULT_STUCK_CHUNK_MINUTES,
        }
    }
}

/// The plugin's section of the config file. Every field is optional; this is
/// the only place partial configuration exists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackfillConfigFile {
    /// Chunk size override.
    pub chunk_hours: Option<u32>,
    /// Concurrency override.
    pub max_parallel_chunks: Option<usize>,
    /// Retry override.
    pub max_retries_per_chunk: Option<u32>,
    /// Idempotency-token requirement override.
    pub require_idempotency_token: Option<bool>,
    /// Time column override.
    pub time_column: Option<String>,
    /// Policy overrides.
    #[serde(default)]
    pub policy: BackfillPolicyFile,
    /// Limit overrides.
    #[serde(default)]
    pub limits: BackfillLimitsFile,
}

/// Optional policy fields as they appear in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackfillPolicyFile {
    /// Override for `require_explicit_window`.
    pub require_explicit_window: Option<bool>,
    /// Override for `block_overlapping_runs`.
    pub block_overlapping_runs: Option<bool>,
    /// Targets requiring a completed backfill.
    pub required_targets: Option<Vec<String>>,
}

/// Optional limit fields as they appear in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackfillLimitsFile {
    /// Override for `max_window_hours`.
    pub max_window_hours: Option<u32>,
    /// Override for `min_chunk_minutes`.
    pub min_chunk_minutes: Option<u32>,
    /// Override for `stuck_chunk_minutes`.
    pub stuck_chunk_minutes: Option<i64>,
}

/// Fully-resolved backfill configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBackfill {
    /// Execution options.
    pub options: BackfillOptions,
    /// Policy.
    pub policy: BackfillPolicy,
    /// Limits.
    pub limits: BackfillLimits,
}

impl ResolvedBackfill {
    /// Normalize a parsed config section against defaults.
    pub fn from_file(file: BackfillConfigFile) -> Self {
        let defaults = BackfillOptions::default();
        let options = BackfillOptions {
            chunk_hours: file.chunk_hours.unwrap_or(defaults.chunk_hours),
            max_parallel_chunks: file
                .max_parallel_chunks
                .unwrap_or(defaults.max_parallel_chunks)
                .max(1),
            max_retries_per_chunk: file
                .max_retries_per_chunk
                .unwrap_or(defaults.max_retries_per_chunk)
                .max(1),
            require_idempotency_token: file
                .require_idempotency_token
                .unwrap_or(defaults.require_idempotency_token),
            time_column: file.time_column.unwrap_or(defaults.time_column),
        };

        let strict = BackfillPolicy::strict();
        let policy = BackfillPolicy {
            require_explicit_window: file
                .policy
                .require_explicit_window
                .unwrap_or(strict.require_explicit_window),
            block_overlapping_runs: file
                .policy
                .block_overlapping_runs
                .unwrap_or(strict.block_overlapping_runs),
            required_targets: file.policy.required_targets.unwrap_or_default(),
        };

        let default_limits = BackfillLimits::default();
        let limits = BackfillLimits {
            max_window_hours: file
                .limits
                .max_window_hours
                .unwrap_or(default_limits.max_window_hours),
            min_chunk_minutes: file
                .limits
                .min_chunk_minutes
                .unwrap_or(default_limits.min_chunk_minutes),
            stuck_chunk_minutes: file
                .limits
                .stuck_chunk_minutes
                .unwrap_or(default_limits.stuck_chunk_minutes),
        };

        Self {
            options,
            policy,
            limits,
        }
    }

    /// Parse and normalize the plugin's raw config table, when present.
    pub fn from_plugin_table(
        table: Option<&serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        match table {
            Some(value) => {
                let file: BackfillConfigFile = serde_json::from_value(value.clone())?;
                Ok(Self::from_file(file))
            }
            None => Ok(Self::default()),
        }
    }
}
