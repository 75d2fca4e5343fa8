//! Structured lifecycle events for grading requests and sandbox attempts.
//!
//! Every function logs one `info!` (or `warn!`) line carrying an
//! `event = "..."` field so log pipelines can filter on it.

use tracing::{info, warn};

/// RAII guard that enters an assessment-scoped span.
///
/// ```ignore
/// let _span = SubmissionSpan::enter("A1");
/// // every event logged here carries assessment_id = "A1"
/// ```
pub struct SubmissionSpan {
    _span: tracing::span::EnteredSpan,
}

impl SubmissionSpan {
    pub fn enter(assessment_id: &str) -> Self {
        let span = tracing::info_span!("gradeflow.submission", assessment_id = %assessment_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_submission_received(assessment_id: &str, criteria: usize) {
    info!(event = "submission.received", assessment_id = %assessment_id, criteria = criteria);
}

/// Emit event: every plugin group resolved and the outcomes are ready.
pub fn emit_submission_dispatched(assessment_id: &str, outcomes: usize, failures: usize) {
    info!(
        event = "submission.dispatched",
        assessment_id = %assessment_id,
        outcomes = outcomes,
        failures = failures,
    );
}

pub fn emit_plugin_invoked(assessment_id: &str, plugin: &str, criteria: usize) {
    info!(event = "plugin.invoked", assessment_id = %assessment_id, plugin = %plugin, criteria = criteria);
}

/// Emit event: a plugin group failed as a whole (warning level).
pub fn emit_plugin_failed(assessment_id: &str, plugin: &str, error: &dyn std::fmt::Display) {
    warn!(event = "plugin.failed", assessment_id = %assessment_id, plugin = %plugin, error = %error);
}

pub fn emit_bundle_packed(bundle_id: &str, criteria: usize, total_size: usize) {
    info!(event = "bundle.packed", bundle_id = %bundle_id, criteria = criteria, total_size = total_size);
}

pub fn emit_bundle_failed(bundle_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "bundle.failed", bundle_id = %bundle_id, error = %error);
}

/// Emit event: a sandbox attempt moved from one step to the next.
pub fn emit_sandbox_transition(attempt_id: &str, from: &str, to: &str) {
    info!(event = "sandbox.transition", attempt_id = %attempt_id, from = %from, to = %to);
}

/// Emit event: a callback arrived for a step the attempt is not waiting on.
pub fn emit_sandbox_callback_ignored(attempt_id: &str, step: &str, callback: &str) {
    warn!(
        event = "sandbox.callback_ignored",
        attempt_id = %attempt_id,
        step = %step,
        callback = %callback,
    );
}

/// Emit event: a callback named an attempt with no cached state.
pub fn emit_sandbox_callback_unknown(attempt_id: &str, callback: &str) {
    warn!(event = "sandbox.callback_unknown", attempt_id = %attempt_id, callback = %callback);
}

pub fn emit_outcome_emitted(assessment_id: &str, graded: usize, errors: usize) {
    info!(event = "outcome.emitted", assessment_id = %assessment_id, graded = graded, errors = errors);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_span_create() {
        let _span = SubmissionSpan::enter("A1");
    }
}
