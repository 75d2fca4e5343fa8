//! Structured lifecycle events are emitted with their `event` field.

use std::sync::Arc;

use gradeflow_core::obs::{
    emit_bundle_failed, emit_outcome_emitted, emit_plugin_failed, emit_sandbox_callback_ignored,
    emit_sandbox_callback_unknown, emit_sandbox_transition, emit_submission_dispatched,
    emit_submission_received, SubmissionSpan,
};
use gradeflow_core::{Criterion, Dispatcher, GradingRequest, PluginRegistry};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn submission_lifecycle_events_carry_the_assessment() {
    emit_submission_received("A-obs-1", 3);
    emit_submission_dispatched("A-obs-1", 3, 1);
    emit_outcome_emitted("A-obs-1", 2, 1);

    assert!(logs_contain("submission.received"));
    assert!(logs_contain("submission.dispatched"));
    assert!(logs_contain("outcome.emitted"));
    assert!(logs_contain("A-obs-1"));
}

#[traced_test]
#[test]
fn failures_are_logged_at_warn() {
    emit_plugin_failed("A-obs-2", "ai", &"model unavailable");
    emit_bundle_failed("bundle-9", &"invalid utf-8");

    assert!(logs_contain("WARN"));
    assert!(logs_contain("plugin.failed"));
    assert!(logs_contain("model unavailable"));
    assert!(logs_contain("bundle.failed"));
}

#[traced_test]
#[test]
fn sandbox_events_name_the_attempt() {
    emit_sandbox_transition("att-obs", "uploaded", "initialized");
    emit_sandbox_callback_ignored("att-obs", "aggregated", "run");
    emit_sandbox_callback_unknown("att-ghost", "init");

    assert!(logs_contain("sandbox.transition"));
    assert!(logs_contain("sandbox.callback_ignored"));
    assert!(logs_contain("sandbox.callback_unknown"));
    assert!(logs_contain("att-ghost"));
}

#[traced_test]
#[test]
fn submission_span_scopes_events() {
    {
        let _span = SubmissionSpan::enter("A-span");
        emit_submission_received("A-span", 0);
    }
    assert!(logs_contain("gradeflow.submission"));
}

#[traced_test]
#[tokio::test]
async fn dispatch_logs_receipt_and_completion() {
    let dispatcher = Dispatcher::new(Arc::new(PluginRegistry::new()));
    let request = GradingRequest {
        assessment_id: "A-obs-3".to_string(),
        criteria: vec![Criterion {
            criterion_name: "C1".to_string(),
            file_refs: vec![],
            levels: vec![],
            plugin: "unknown-plugin".to_string(),
            configuration: String::new(),
        }],
        attachments: vec![],
        metadata: Default::default(),
    };

    let outcomes = dispatcher.dispatch(&request).await;

    assert_eq!(outcomes.len(), 1);
    assert!(logs_contain("submission.received"));
    assert!(logs_contain("submission.dispatched"));
}
