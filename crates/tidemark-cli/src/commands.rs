//! Command definitions and handlers.

use crate::exec::{CommandExecutor, EchoExecutor};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tidemark_backfill::{
    BackfillEngine, BackfillError, BackfillPlugin, CancelOutcome, ExecuteOptions, FaultInjection,
    PlanId, PlanRequest, PlanStatus, ResolvedBackfill, StateStore,
};
use tidemark_core::{
    CheckContext, CheckFinding, HostError, MigrationPlugin, OutputSink, ResolvedConfig, Severity,
    SqlExecutor, StdoutSink,
};

/// Version of the JSON payloads emitted by `--json`.
const PAYLOAD_VERSION: u32 = 1;

/// Tidemark schema-migration CLI.
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(version, about = "Schema migrations and data backfills for analytical databases")]
pub struct Args {
    /// Path to the config file (JSON).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// State directory override.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Emit results as versioned JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Time-windowed data backfills.
    Backfill {
        #[command(subcommand)]
        command: BackfillCommand,
    },
    /// Preflight check across all configured plugins.
    Check,
}

/// Backfill plugin commands.
#[derive(Subcommand, Debug)]
pub enum BackfillCommand {
    /// Build (or load) a chunked backfill plan.
    Plan {
        /// Target object the backfill writes into.
        #[arg(long)]
        target: String,

        /// Window start, inclusive (RFC 3339, or YYYY-MM-DD).
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Window end, exclusive (RFC 3339, or YYYY-MM-DD).
        #[arg(long, requires = "from")]
        to: Option<String>,

        /// Chunk size in hours.
        #[arg(long)]
        chunk_hours: Option<u32>,

        /// Time column the chunk window predicates against.
        #[arg(long)]
        time_column: Option<String>,

        /// SQL template; placeholders: {from} {to} {token} {time_column} {target}.
        #[arg(long)]
        sql: String,

        /// Allow a window larger than the configured limit.
        #[arg(long)]
        force_window: bool,
    },

    /// Start a fresh run of a plan.
    Run {
        /// Plan to execute.
        plan_id: String,

        /// Start despite an overlapping plan on the same target.
        #[arg(long)]
        force_overlap: bool,

        /// Run despite an environment fingerprint mismatch.
        #[arg(long)]
        force_environment: bool,

        /// Log statements instead of executing them.
        #[arg(long)]
        dry_run: bool,

        /// Simulate failures of this chunk (testing).
        #[arg(long, requires = "fail_count", hide = true)]
        fail_chunk: Option<u32>,

        /// Number of simulated failures (testing).
        #[arg(long, requires = "fail_chunk", hide = true)]
        fail_count: Option<u32>,
    },

    /// Resume an existing run.
    Resume {
        /// Plan whose run to resume.
        plan_id: String,

        /// Re-execute chunks already done.
        #[arg(long)]
        replay_done: bool,

        /// Re-execute chunks already failed.
        #[arg(long)]
        replay_failed: bool,

        /// Mark failed chunks skipped instead of re-executing them.
        #[arg(long, conflicts_with = "replay_failed")]
        skip_failed: bool,

        /// Resume despite an options-compatibility mismatch.
        #[arg(long)]
        force_compatibility: bool,

        /// Resume despite an environment fingerprint mismatch.
        #[arg(long)]
        force_environment: bool,

        /// Log statements instead of executing them.
        #[arg(long)]
        dry_run: bool,

        /// Simulate failures of this chunk (testing).
        #[arg(long, requires = "fail_count", hide = true)]
        fail_chunk: Option<u32>,

        /// Number of simulated failures (testing).
        #[arg(long, requires = "fail_chunk", hide = true)]
        fail_count: Option<u32>,
    },

    /// Summarize a run's chunk states.
    Status {
        /// Plan whose run to summarize.
        plan_id: String,
    },

    /// Stop a run. In-flight chunk attempts finish first.
    Cancel {
        /// Plan whose run to stop.
        plan_id: String,

        /// Mark the run paused (resumable) instead of cancelled.
        #[arg(long)]
        pause: bool,
    },

    /// Diagnose a stuck or failed run and propose recovery steps.
    Doctor {
        /// Plan whose run to diagnose.
        plan_id: String,
    },
}

/// CLI-level errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Host/config failure.
    #[error(transparent)]
    Host(#[from] HostError),

    /// Engine failure.
    #[error(transparent)]
    Backfill(#[from] BackfillError),

    /// Bad command-line input.
    #[error("{0}")]
    InvalidArg(String),
}

/// Parse an RFC 3339 timestamp, accepting bare dates as midnight UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CliError> {
    let candidate = if raw.len() == 10 && raw.as_bytes().get(4) == Some(&b'-') {
        format!("{}T00:00:00Z", raw)
    } else {
        raw.to_string()
    };
    DateTime::parse_from_rfc3339(&candidate)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CliError::InvalidArg(format!("bad timestamp '{}': {}", raw, e)))
}

fn load_config(args: &Args) -> Result<ResolvedConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => ResolvedConfig::load(path)?,
        None => ResolvedConfig::default(),
    };
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    Ok(config)
}

fn build_executor(
    config: &ResolvedConfig,
    dry_run: bool,
) -> Result<Arc<dyn SqlExecutor>, CliError> {
    if dry_run {
        return Ok(Arc::new(EchoExecutor));
    }
    match config
        .database
        .as_ref()
        .and_then(|db| db.client_command.as_deref())
    {
        Some(command) => {
            let executor = CommandExecutor::new(command)
                .map_err(|e| HostError::ConfigInvalid {
                    message: e.to_string(),
                })?;
            Ok(Arc::new(executor))
        }
        None => Err(CliError::from(HostError::ConfigInvalid {
            message: "no database.client_command configured; pass --dry-run to skip execution"
                .to_string(),
        })),
    }
}

fn build_engine(
    config: &ResolvedConfig,
    executor: Arc<dyn SqlExecutor>,
) -> Result<BackfillEngine, CliError> {
    let resolved = ResolvedBackfill::from_plugin_table(
        config.plugin_table(tidemark_backfill::PLUGIN_NAME),
    )
    .map_err(|e| HostError::ConfigInvalid {
        message: format!("bad 'backfill' section: {}", e),
    })?;
    Ok(BackfillEngine::new(
        StateStore::new(&config.state_dir),
        resolved,
        config.environment(),
        executor,
    ))
}

fn emit_json(sink: &dyn OutputSink, kind: &str, data: serde_json::Value) {
    let payload = serde_json::json!({
        "version": PAYLOAD_VERSION,
        "kind": kind,
        "data": data,
    });
    sink.print(&payload.to_string());
}

fn fault_from(fail_chunk: Option<u32>, fail_count: Option<u32>) -> Option<FaultInjection> {
    match (fail_chunk, fail_count) {
        (Some(fail_chunk_id), Some(fail_count)) => Some(FaultInjection {
            fail_chunk_id,
            fail_count,
        }),
        _ => None,
    }
}

/// Execute a parsed command. Returns the process exit code.
pub async fn dispatch(args: Args) -> Result<u8, CliError> {
    let config = load_config(&args)?;
    let sink = StdoutSink;

    match args.command {
        Command::Backfill { command } => {
            backfill_command(command, &config, args.json, &sink).await
        }
        Command::Check => check_command(&config, args.json, &sink).await,
    }
}

async fn backfill_command(
    command: BackfillCommand,
    config: &ResolvedConfig,
    json: bool,
    sink: &dyn OutputSink,
) -> Result<u8, CliError> {
    match command {
        BackfillCommand::Plan {
            target,
            from,
            to,
            chunk_hours,
            time_column,
            sql,
            force_window,
        } => {
            let engine = build_engine(config, Arc::new(EchoExecutor))?;
            let window = match (from, to) {
                (Some(from), Some(to)) => {
                    Some((parse_timestamp(&from)?, parse_timestamp(&to)?))
                }
                _ => None,
            };
            let outcome = engine.plan(PlanRequest {
                target,
                window,
                chunk_hours,
                time_column,
                sql_template: sql,
                force_window,
            })?;

            if json {
                emit_json(
                    sink,
                    "plan",
                    serde_json::json!({
                        "plan": outcome.plan,
                        "path": outcome.path,
                        "already_existed": outcome.already_existed,
                    }),
                );
            } else if outcome.already_existed {
                sink.print(&format!(
                    "plan {} already exists ({} chunks), loaded from {}",
                    outcome.plan.plan_id,
                    outcome.plan.chunks.len(),
                    outcome.path.display(),
                ));
            } else {
                sink.print(&format!(
                    "plan {} created: {} chunks of {}h over [{}, {}), persisted to {}",
                    outcome.plan.plan_id,
                    outcome.plan.chunks.len(),
                    outcome.plan.options.chunk_hours,
                    outcome.plan.from.to_rfc3339(),
                    outcome.plan.to.to_rfc3339(),
                    outcome.path.display(),
                ));
            }
            Ok(0)
        }

        BackfillCommand::Run {
            plan_id,
            force_overlap,
            force_environment,
            dry_run,
            fail_chunk,
            fail_count,
        } => {
            let executor = build_executor(config, dry_run)?;
            let engine = build_engine(config, executor)?;
            let run = engine
                .run(
                    &PlanId::parse(&plan_id),
                    ExecuteOptions {
                        force_overlap,
                        force_environment,
                        fault: fault_from(fail_chunk, fail_count),
                        ..Default::default()
                    },
                )
                .await?;
            report_run(&engine, &run.plan_id, json, sink)
        }

        BackfillCommand::Resume {
            plan_id,
            replay_done,
            replay_failed,
            skip_failed,
            force_compatibility,
            force_environment,
            dry_run,
            fail_chunk,
            fail_count,
        } => {
            let executor = build_executor(config, dry_run)?;
            let engine = build_engine(config, executor)?;
            let run = engine
                .resume(
                    &PlanId::parse(&plan_id),
                    ExecuteOptions {
                        replay_done,
                        replay_failed,
                        skip_failed,
                        force_compatibility,
                        force_environment,
                        fault: fault_from(fail_chunk, fail_count),
                        ..Default::default()
                    },
                )
                .await?;
            report_run(&engine, &run.plan_id, json, sink)
        }

        BackfillCommand::Status { plan_id } => {
            let engine = build_engine(config, Arc::new(EchoExecutor))?;
            let plan_id = PlanId::parse(&plan_id);
            let summary = engine.status(&plan_id)?;

            if json {
                emit_json(sink, "status", serde_json::to_value(&summary).unwrap_or_default());
            } else {
                let run = engine.store().load_run(&plan_id)?;
                let mut table = Table::new();
                table.load_preset(UTF8_FULL_CONDENSED).set_header(vec![
                    "chunk", "window", "status", "attempts", "last error",
                ]);
                for chunk in &run.chunks {
                    table.add_row(vec![
                        chunk.id.to_string(),
                        format!("[{}, {})", chunk.from.to_rfc3339(), chunk.to.to_rfc3339()),
                        chunk.status.to_string(),
                        chunk.attempts.to_string(),
                        chunk.last_error.clone().unwrap_or_default(),
                    ]);
                }
                sink.print(&table.to_string());
                sink.print(&format!(
                    "{} {}: {} total, {} done, {} failed, {} pending, {} running, {} skipped ({} attempts)",
                    summary.plan_id,
                    summary.status,
                    summary.chunks.total,
                    summary.chunks.done,
                    summary.chunks.failed,
                    summary.chunks.pending,
                    summary.chunks.running,
                    summary.chunks.skipped,
                    summary.attempts,
                ));
            }
            Ok(0)
        }

        BackfillCommand::Cancel { plan_id, pause } => {
            let engine = build_engine(config, Arc::new(EchoExecutor))?;
            let outcome = engine.cancel(&PlanId::parse(&plan_id), pause)?;

            let (kind, message) = match &outcome {
                CancelOutcome::Signalled => (
                    "signalled",
                    "stop requested; the coordinator will drain in-flight chunks".to_string(),
                ),
                CancelOutcome::Applied(run) => {
                    ("applied", format!("run marked {}", run.status))
                }
            };
            if json {
                emit_json(sink, "cancel", serde_json::json!({ "outcome": kind }));
            } else {
                sink.print(&message);
            }
            Ok(0)
        }

        BackfillCommand::Doctor { plan_id } => {
            let engine = build_engine(config, Arc::new(EchoExecutor))?;
            let report = engine.doctor(&PlanId::parse(&plan_id))?;

            if json {
                emit_json(sink, "doctor", serde_json::to_value(&report).unwrap_or_default());
            } else if report.is_healthy() {
                sink.print(&format!("{}: no issues found", report.plan_id));
            } else {
                for issue in &report.issues {
                    sink.print(&format!("[{}] {}", issue.code, issue.message));
                }
                for rec in &report.recommendations {
                    sink.print(&format!("  -> {}", rec));
                }
            }
            Ok(if report.is_healthy() { 0 } else { 1 })
        }
    }
}

fn report_run(
    engine: &BackfillEngine,
    plan_id: &PlanId,
    json: bool,
    sink: &dyn OutputSink,
) -> Result<u8, CliError> {
    let summary = engine.status(plan_id)?;
    if json {
        emit_json(sink, "run", serde_json::to_value(&summary).unwrap_or_default());
    } else {
        sink.print(&format!(
            "run {}: {} ({} done, {} failed, {} pending of {})",
            summary.plan_id,
            summary.status,
            summary.chunks.done,
            summary.chunks.failed,
            summary.chunks.pending,
            summary.chunks.total,
        ));
        if let Some(error) = &summary.last_error {
            sink.print(&format!("last error: {}", error));
        }
    }
    Ok(if summary.status == PlanStatus::Failed { 1 } else { 0 })
}

async fn check_command(
    config: &ResolvedConfig,
    json: bool,
    sink: &dyn OutputSink,
) -> Result<u8, CliError> {
    let plugin = BackfillPlugin::new();
    plugin.on_config_loaded(config).await?;

    let ctx = CheckContext { config };
    let findings: Vec<CheckFinding> = plugin.on_check(&ctx).await?;

    let errors = findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .count();

    if json {
        emit_json(
            sink,
            "check",
            serde_json::json!({
                "findings": findings,
                "errors": errors,
            }),
        );
    } else {
        if findings.is_empty() {
            sink.print("check passed: no findings");
        }
        for finding in &findings {
            sink.print(&format!(
                "{:5} {}: {}",
                finding.severity.to_string(),
                finding.code,
                finding.message,
            ));
        }
    }

    plugin.on_check_report(&findings, sink).await?;
    Ok(if errors > 0 { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_plan_command() {
        let args = Args::try_parse_from([
            "tidemark",
            "backfill",
            "plan",
            "--target",
            "events",
            "--from",
            "2024-01-01",
            "--to",
            "2024-01-03T00:00:00Z",
            "--sql",
            "INSERT /* {token} */",
        ])
        .unwrap();
        match args.command {
            Command::Backfill {
                command: BackfillCommand::Plan { target, from, to, .. },
            } => {
                assert_eq!(target, "events");
                assert_eq!(from.as_deref(), Some("2024-01-01"));
                assert_eq!(to.as_deref(), Some("2024-01-03T00:00:00Z"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_from_requires_to() {
        let result = Args::try_parse_from([
            "tidemark", "backfill", "plan", "--target", "events", "--from", "2024-01-01",
            "--sql", "{token}",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_fail_chunk_requires_fail_count() {
        let result = Args::try_parse_from([
            "tidemark", "backfill", "run", "bf-abc", "--fail-chunk", "1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_timestamp_accepts_bare_dates() {
        let ts = parse_timestamp("2024-01-01").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        let ts = parse_timestamp("2024-01-01T12:30:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T12:30:00+00:00");

        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_global_flags() {
        let args = Args::try_parse_from([
            "tidemark",
            "--json",
            "--state-dir",
            "/tmp/state",
            "backfill",
            "status",
            "bf-abc",
        ])
        .unwrap();
        assert!(args.json);
        assert_eq!(args.state_dir.as_deref(), Some(std::path::Path::new("/tmp/state")));
    }
}
