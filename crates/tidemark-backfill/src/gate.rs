//! The policy gate.
//!
//! Invoked by the host's preflight check. The gate evaluates persisted plan
//! and run state against the resolved policy and emits structured findings;
//! it never blocks anything itself. The host decides whether `error`-severity
//! findings fail the check.

use crate::options::{BackfillPolicy, ResolvedBackfill};
use crate::error::BackfillError;
use crate::plan::BackfillPlanState;
use crate::state::{BackfillRunState, PlanStatus};
use crate::store::StateStore;
use serde_json::json;
use tidemark_core::{CheckFinding, Severity};

/// A required target has no plan.
pub const CODE_PLAN_MISSING: &str = "backfill_plan_missing";
/// A plan's options drifted from the currently-resolved options.
pub const CODE_PLAN_STALE: &str = "backfill_plan_stale";
/// The resolved policy is weaker than the strict baseline.
pub const CODE_POLICY_RELAXED: &str = "backfill_policy_relaxed";
/// Two plans overlap on the same target while overlaps are blocked.
pub const CODE_OVERLAP_BLOCKED: &str = "backfill_overlap_blocked";
/// A plan's window exceeds the configured limit.
pub const CODE_WINDOW_EXCEEDS_LIMIT: &str = "backfill_window_exceeds_limit";
/// A run holds chunks that failed with retries exhausted.
pub const CODE_CHUNK_RETRY_EXHAUSTED: &str = "backfill_chunk_failed_retry_exhausted";
/// A required backfill exists but has not completed.
pub const CODE_REQUIRED_PENDING: &str = "backfill_required_pending";

/// Evaluate the gate over all persisted state.
pub fn evaluate(
    store: &StateStore,
    resolved: &ResolvedBackfill,
) -> Result<Vec<CheckFinding>, BackfillError> {
    let plans = store.list_plans()?;
    let mut runs = Vec::with_capacity(plans.len());
    for plan in &plans {
        runs.push(store.try_load_run(&plan.plan_id)?);
    }

    let mut findings = Vec::new();
    check_plan_missing(&plans, &resolved.policy, &mut findings);
    check_plan_stale(&plans, resolved, &mut findings);
    check_policy_relaxed(&resolved.policy, &mut findings);
    check_overlap_blocked(&plans, &runs, &resolved.policy, &mut findings);
    check_window_limit(&plans, resolved, &mut findings);
    check_retry_exhausted(&plans, &runs, &mut findings);
    check_required_pending(&plans, &runs, &resolved.policy, &mut findings);
    Ok(findings)
}

fn check_plan_missing(
    plans: &[BackfillPlanState],
    policy: &BackfillPolicy,
    findings: &mut Vec<CheckFinding>,
) {
    for target in &policy.required_targets {
        if !plans.iter().any(|p| &p.target == target) {
            findings.push(
                CheckFinding::new(
                    CODE_PLAN_MISSING,
                    Severity::Error,
                    format!("target '{}' requires a backfill but no plan exists", target),
                )
                .with_metadata(json!({ "target": target })),
            );
        }
    }
}

fn check_plan_stale(
    plans: &[BackfillPlanState],
    resolved: &ResolvedBackfill,
    findings: &mut Vec<CheckFinding>,
) {
    let current_token = resolved.options.compatibility_token();
    for plan in plans {
        let plan_token = plan.options.compatibility_token();
        if plan_token != current_token {
            findings.push(
                CheckFinding::new(
                    CODE_PLAN_STALE,
                    Severity::Warn,
                    format!(
                        "plan {} was built with options that no longer match the configuration",
                        plan.plan_id,
                    ),
                )
                .with_metadata(json!({
                    "plan_id": plan.plan_id.to_string(),
                    "plan_token": plan_token,
                    "current_token": current_token,
                })),
            );
        }
    }
}

fn check_policy_relaxed(policy: &BackfillPolicy, findings: &mut Vec<CheckFinding>) {
    let relaxed = policy.relaxed_fields();
    if !relaxed.is_empty() {
        findings.push(
            CheckFinding::new(
                CODE_POLICY_RELAXED,
                Severity::Warn,
                format!("policy is relaxed versus the strict default: {}", relaxed.join(", ")),
            )
            .with_metadata(json!({ "relaxed": relaxed })),
        );
    }
}

fn check_overlap_blocked(
    plans: &[BackfillPlanState],
    runs: &[Option<BackfillRunState>],
    policy: &BackfillPolicy,
    findings: &mut Vec<CheckFinding>,
) {
    if !policy.block_overlapping_runs {
        return;
    }
    for (i, plan) in plans.iter().enumerate() {
        for (other, other_run) in plans.iter().zip(runs).skip(i + 1) {
            if plan.target != other.target || !plan.overlaps(other.from, other.to) {
                continue;
            }
            let other_blocks = match other_run {
                Some(run) => !matches!(run.status, PlanStatus::Completed | PlanStatus::Cancelled),
                None => true,
            };
            if other_blocks {
                findings.push(
                    CheckFinding::new(
                        CODE_OVERLAP_BLOCKED,
                        Severity::Error,
                        format!(
                            "plans {} and {} overlap on '{}' while overlapping runs are blocked",
                            plan.plan_id, other.plan_id, plan.target,
                        ),
                    )
                    .with_metadata(json!({
                        "target": plan.target,
                        "plans": [plan.plan_id.to_string(), other.plan_id.to_string()],
                    })),
                );
            }
        }
    }
}

fn check_window_limit(
    plans: &[BackfillPlanState],
    resolved: &ResolvedBackfill,
    findings: &mut Vec<CheckFinding>,
) {
    let limit = i64::from(resolved.limits.max_window_hours);
    for plan in plans {
        let hours = plan.window_hours();
        if hours > limit {
            findings.push(
                CheckFinding::new(
                    CODE_WINDOW_EXCEEDS_LIMIT,
                    Severity::Warn,
                    format!(
                        "plan {} spans {}h, above the {}h limit",
                        plan.plan_id, hours, limit,
                    ),
                )
                .with_metadata(json!({
                    "plan_id": plan.plan_id.to_string(),
                    "window_hours": hours,
                    "limit_hours": limit,
                })),
            );
        }
    }
}

fn check_retry_exhausted(
    plans: &[BackfillPlanState],
    runs: &[Option<BackfillRunState>],
    findings: &mut Vec<CheckFinding>,
) {
    for (plan, run) in plans.iter().zip(runs) {
        let Some(run) = run else { continue };
        for chunk in &run.chunks {
            if chunk.status == crate::state::ChunkStatus::Failed
                && chunk.attempts >= plan.options.max_retries_per_chunk
            {
                findings.push(
                    CheckFinding::new(
                        CODE_CHUNK_RETRY_EXHAUSTED,
                        Severity::Error,
                        format!(
                            "plan {} chunk {} failed with retries exhausted ({} attempts)",
                            plan.plan_id, chunk.id, chunk.attempts,
                        ),
                    )
                    .with_metadata(json!({
                        "plan_id": plan.plan_id.to_string(),
                        "chunk_id": chunk.id,
                        "attempts": chunk.attempts,
                        "last_error": chunk.last_error,
                    })),
                );
            }
        }
    }
}

fn check_required_pending(
    plans: &[BackfillPlanState],
    runs: &[Option<BackfillRunState>],
    policy: &BackfillPolicy,
    findings: &mut Vec<CheckFinding>,
) {
    for target in &policy.required_targets {
        for (plan, run) in plans.iter().zip(runs) {
            if &plan.target != target {
                continue;
            }
            let completed = matches!(
                run,
                Some(run) if run.status == PlanStatus::Completed
            );
            if !completed {
                findings.push(
                    CheckFinding::new(
                        CODE_REQUIRED_PENDING,
                        Severity::Warn,
                        format!(
                            "required backfill for '{}' (plan {}) has not completed",
                            target, plan.plan_id,
                        ),
                    )
                    .with_metadata(json!({
                        "target": target,
                        "plan_id": plan.plan_id.to_string(),
                        "run_status": run.as_ref().map(|r| r.status.to_string()),
                    })),
                );
            }
        }
    }
}
