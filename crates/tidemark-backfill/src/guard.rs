//! Environment and compatibility guards.
//!
//! Both run before any execution: a plan bound to one database environment
//! must not run against another, and a run must not silently resume with
//! different chunking or retry semantics than it began with.

use crate::error::BackfillError;
use crate::options::BackfillOptions;
use crate::plan::BackfillPlanState;
use crate::state::BackfillRunState;
use tidemark_core::EnvironmentFingerprint;

/// Verify the active environment matches the plan's bound fingerprint.
///
/// Plans without a fingerprint were created offline and are accepted against
/// any environment. `force` overrides a mismatch; the caller records the
/// override on the run for audit.
pub fn check_environment(
    plan: &BackfillPlanState,
    active: Option<&EnvironmentFingerprint>,
    force: bool,
) -> Result<(), BackfillError> {
    let bound = match &plan.environment {
        Some(bound) => bound,
        None => return Ok(()),
    };

    match active {
        Some(active) if active == bound => Ok(()),
        _ if force => {
            tracing::warn!(
                plan_id = %plan.plan_id,
                bound = %bound,
                "environment mismatch overridden by --force-environment"
            );
            Ok(())
        }
        Some(active) => Err(BackfillError::EnvironmentMismatch {
            plan_id: plan.plan_id.clone(),
            bound: bound.clone(),
            active: active.clone(),
        }),
        None => Err(BackfillError::EnvironmentMissing {
            plan_id: plan.plan_id.clone(),
            bound: bound.clone(),
        }),
    }
}

/// Verify the run's recorded compatibility token still matches the token of
/// the current options. A mismatch means the plan or its options changed
/// between runs; resuming would silently change chunking/retry semantics.
pub fn check_compatibility(
    run: &BackfillRunState,
    current: &BackfillOptions,
    force: bool,
) -> Result<(), BackfillError> {
    let current_token = current.compatibility_token();
    if run.compatibility_token == current_token {
        return Ok(());
    }
    if force {
        tracing::warn!(
            plan_id = %run.plan_id,
            recorded = %run.compatibility_token,
            current = %current_token,
            "compatibility mismatch overridden by --force-compatibility"
        );
        return Ok(());
    }
    Err(BackfillError::CompatibilityMismatch {
        recorded: run.compatibility_token.clone(),
        current: current_token,
    })
}
