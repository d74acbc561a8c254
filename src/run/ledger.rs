//! Step Ledger — legal step-status transitions and progression order.

use tracing::warn;

use crate::error::LedgerError;

use super::model::{Run, Step, StepStatus};

impl StepStatus {
    /// Check if a transition from `self` to `target` is valid.
    ///
    /// Legal: pending→running, running→completed, running→failed,
    /// failed→running (retry). Everything else is rejected.
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Failed, Running)
        )
    }
}

/// Apply a step-status transition to a copy of the run.
///
/// The transition is atomic: on any error the original run is untouched and
/// the returned `Run` never exists. Illegal transitions indicate a logic
/// error upstream and are rejected, never coerced.
pub fn advance(run: &Run, step_id: u32, new_status: StepStatus) -> Result<Run, LedgerError> {
    let mut updated = run.clone();
    let step = updated
        .steps
        .iter_mut()
        .find(|s| s.id == step_id)
        .ok_or(LedgerError::UnknownStep { step_id })?;

    if !step.status.can_transition_to(new_status) {
        warn!(
            step_id,
            from = %step.status,
            to = %new_status,
            "Rejected illegal step transition"
        );
        return Err(LedgerError::InvalidTransition {
            step_id,
            from: step.status,
            to: new_status,
        });
    }

    step.status = new_status;
    Ok(updated)
}

/// The step an incoming observation should be evaluated against: the first
/// non-completed step. Observations never evaluate against a later step, so
/// progression is strictly left to right with no skipping.
pub fn next_pending_step(run: &Run) -> Option<&Step> {
    run.steps.iter().find(|s| s.status != StepStatus::Completed)
}
