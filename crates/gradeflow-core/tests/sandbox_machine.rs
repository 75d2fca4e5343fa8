//! Sandbox attempt state machine: callback ordering, terminal states and
//! unknown attempts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use gradeflow_core::fakes::{MemoryTransport, RecordingSandboxClient};
use gradeflow_core::plugins::config::{parse_config, TestRunnerConfig};
use gradeflow_core::sandbox::go_judge::CmdFile;
use gradeflow_core::sandbox::{JudgeResult, JudgeStatus};
use gradeflow_core::{
    Callback, CallbackDisposition, CallbackKind, Criterion, Level, ResultEmitter, RetryPolicy,
    SandboxError, SandboxMachine, SandboxSettings, SandboxStep, StartAttempt, UnknownCallbackPolicy,
};
use gradeflow_state::fakes::MemoryKvStore;

const GRADED: &str = "grading.criterion.graded";
const FAILED: &str = "grading.criterion.failed";

struct Harness {
    transport: Arc<MemoryTransport>,
    client: Arc<RecordingSandboxClient>,
    machine: Arc<SandboxMachine>,
}

fn harness_with(policy: UnknownCallbackPolicy) -> Harness {
    let transport = Arc::new(MemoryTransport::new());
    let client = Arc::new(RecordingSandboxClient::new());
    let emitter = Arc::new(ResultEmitter::new(
        transport.clone(),
        RetryPolicy {
            max_attempts: 1,
            backoff_base_ms: 1,
        },
    ));
    let machine = Arc::new(SandboxMachine::new(
        Arc::new(MemoryKvStore::new()),
        client.clone(),
        emitter,
        SandboxSettings {
            store_dir: PathBuf::from("/shm/judge"),
            unknown_callback: policy,
            ..SandboxSettings::default()
        },
    ));
    Harness {
        transport,
        client,
        machine,
    }
}

fn harness() -> Harness {
    harness_with(UnknownCallbackPolicy::Drop)
}

fn config(init: Option<&str>) -> TestRunnerConfig {
    let mut doc = serde_json::json!({
        "type": "test-runner",
        "runCommand": "python main.py",
        "testCases": [
            {"input": "1\n", "output": "2\n", "description": "doubles one"},
            {"input": "2\n", "output": "4\n"}
        ]
    });
    if let Some(command) = init {
        doc["initCommand"] = serde_json::json!(command);
    }
    parse_config(&doc.to_string()).unwrap()
}

fn attempt(id: &str, init: Option<&str>) -> StartAttempt {
    StartAttempt {
        attempt_id: id.to_string(),
        assessment_id: "A1".to_string(),
        criterion: Criterion {
            criterion_name: "Runs".to_string(),
            file_refs: vec!["g1/s1/main.py".to_string()],
            levels: [("none", 0), ("half", 50), ("full", 100)]
                .iter()
                .map(|(tag, weight)| Level {
                    tag: tag.to_string(),
                    description: String::new(),
                    weight: *weight,
                })
                .collect(),
            plugin: "test-runner".to_string(),
            configuration: String::new(),
        },
        config: config(init),
        files: BTreeMap::from([(
            "main.py".to_string(),
            "print(int(input()) * 2)\n".to_string(),
        )]),
    }
}

fn result(status: JudgeStatus, exit_status: i32, files: &[(&str, &str)]) -> JudgeResult {
    JudgeResult {
        status,
        error: None,
        exit_status,
        time: 1_000,
        memory: 1_024,
        run_time: 2_000,
        files: files
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn stdout(text: &str) -> JudgeResult {
    result(JudgeStatus::Accepted, 0, &[("stdout", text), ("stderr", "")])
}

fn callback(kind: CallbackKind, id: &str, results: Vec<JudgeResult>) -> Callback {
    Callback {
        kind,
        attempt_id: id.to_string(),
        assessment_id: Some("A1".to_string()),
        criterion_name: Some("Runs".to_string()),
        results,
    }
}

async fn step(h: &Harness, id: &str) -> SandboxStep {
    h.machine.state(id).await.unwrap().expect("attempt record").step
}

#[tokio::test]
async fn attempt_without_init_runs_immediately_and_completes() {
    let h = harness();
    let started = h.machine.start(attempt("att-1", None)).await.unwrap();
    assert_eq!(started, SandboxStep::Running);
    assert_eq!(step(&h, "att-1").await, SandboxStep::Running);

    let submissions = h.client.submissions();
    assert_eq!(submissions.len(), 1);
    let (request, target) = &submissions[0];
    assert_eq!(target.kind, CallbackKind::Run);
    assert_eq!(target.criterion_name, "Runs");
    assert_eq!(request.cmd.len(), 2);
    assert_eq!(
        request.cmd[0].copy_in.get("main.py"),
        Some(&CmdFile::Memory {
            content: "print(int(input()) * 2)\n".to_string()
        })
    );
    assert_eq!(
        request.cmd[1].files[0],
        CmdFile::Memory {
            content: "2\n".to_string()
        }
    );

    let done = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-1", vec![stdout("2\n"), stdout("4\n")]))
        .await
        .unwrap();
    assert_eq!(done, CallbackDisposition::Completed);
    assert_eq!(step(&h, "att-1").await, SandboxStep::Aggregated);

    let graded = h.transport.published_on(GRADED);
    assert_eq!(graded.len(), 1);
    assert_eq!(graded[0]["assessmentId"], "A1");
    assert_eq!(graded[0]["criterionName"], "Runs");
    assert_eq!(graded[0]["scoreBreakdown"]["tag"], "full");
    assert_eq!(graded[0]["scoreBreakdown"]["rawScore"], 100.0);
    assert_eq!(graded[0]["scoreBreakdown"]["summary"], "2/2 test cases passed");
    assert_eq!(graded[0]["metadata"]["testCases"][0]["description"], "doubles one");
}

#[tokio::test]
async fn duplicate_run_callback_is_ignored_after_aggregation() {
    let h = harness();
    h.machine.start(attempt("att-dup", None)).await.unwrap();
    let results = vec![stdout("2\n"), stdout("4\n")];

    let first = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-dup", results.clone()))
        .await
        .unwrap();
    let second = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-dup", results))
        .await
        .unwrap();

    assert_eq!(first, CallbackDisposition::Completed);
    assert_eq!(second, CallbackDisposition::Ignored);
    assert_eq!(h.transport.published_on(GRADED).len(), 1);
    let record = h.machine.state("att-dup").await.unwrap().unwrap();
    assert_eq!(record.processed_count, 2);
    assert_eq!(record.results.len(), 2);
}

#[tokio::test]
async fn init_flow_ignores_early_run_and_runs_from_the_store() {
    let h = harness();
    let started = h.machine.start(attempt("att-2", Some("pip install -r req.txt"))).await.unwrap();
    assert_eq!(started, SandboxStep::Uploaded);

    let submissions = h.client.submissions();
    assert_eq!(submissions.len(), 1);
    let (init, target) = &submissions[0];
    assert_eq!(target.kind, CallbackKind::Init);
    assert_eq!(init.cmd.len(), 1);
    assert_eq!(init.cmd[0].copy_out_dir.as_deref(), Some("att-2"));
    assert!(init.cmd[0].copy_in.contains_key("main.py"));

    // A run result cannot precede the init result.
    let early = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-2", vec![stdout("2\n")]))
        .await
        .unwrap();
    assert_eq!(early, CallbackDisposition::Ignored);
    assert_eq!(step(&h, "att-2").await, SandboxStep::Uploaded);

    let advanced = h
        .machine
        .handle_callback(callback(CallbackKind::Init, "att-2", vec![stdout("")]))
        .await
        .unwrap();
    assert_eq!(advanced, CallbackDisposition::Advanced(SandboxStep::Running));
    assert_eq!(step(&h, "att-2").await, SandboxStep::Running);

    let submissions = h.client.submissions();
    assert_eq!(submissions.len(), 2);
    let (run, target) = &submissions[1];
    assert_eq!(target.kind, CallbackKind::Run);
    assert_eq!(run.cmd.len(), 2);
    assert_eq!(
        run.cmd[0].copy_in.get("."),
        Some(&CmdFile::Local {
            src: "/shm/judge/att-2".to_string()
        })
    );
    assert!(run.cmd[0].copy_out_dir.is_none());

    // A repeated init callback must not restart the attempt.
    let repeat = h
        .machine
        .handle_callback(callback(CallbackKind::Init, "att-2", vec![stdout("")]))
        .await
        .unwrap();
    assert_eq!(repeat, CallbackDisposition::Ignored);
    assert_eq!(h.client.submissions().len(), 2);
}

#[tokio::test]
async fn short_run_batch_completes_with_missing_cases_failed() {
    let h = harness();
    h.machine.start(attempt("att-3", None)).await.unwrap();

    let done = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-3", vec![stdout("2\n")]))
        .await
        .unwrap();
    assert_eq!(done, CallbackDisposition::Completed);
    assert_eq!(step(&h, "att-3").await, SandboxStep::Aggregated);

    let graded = h.transport.published_on(GRADED);
    assert_eq!(graded.len(), 1);
    assert_eq!(graded[0]["scoreBreakdown"]["rawScore"], 50.0);
    assert_eq!(graded[0]["scoreBreakdown"]["tag"], "half");
    let cases = graded[0]["metadata"]["testCases"].as_array().unwrap();
    assert_eq!(cases[0]["status"], "No result");
    assert_eq!(cases[0]["passed"], false);
    assert_eq!(cases[1]["status"], "Passed");
}

#[tokio::test]
async fn redelivered_short_batch_does_not_shift_results() {
    let h = harness();
    h.machine.start(attempt("att-3b", None)).await.unwrap();
    let batch = || callback(CallbackKind::Run, "att-3b", vec![stdout("2\n")]);

    let first = h.machine.handle_callback(batch()).await.unwrap();
    let again = h.machine.handle_callback(batch()).await.unwrap();
    let rest = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-3b", vec![stdout("4\n")]))
        .await
        .unwrap();

    assert_eq!(first, CallbackDisposition::Completed);
    assert_eq!(again, CallbackDisposition::Ignored);
    assert_eq!(rest, CallbackDisposition::Ignored);
    let record = h.machine.state("att-3b").await.unwrap().unwrap();
    assert_eq!(record.processed_count, 1);
    assert_eq!(record.results.len(), 1);
    assert_eq!(h.transport.published_on(GRADED).len(), 1);
}

#[tokio::test]
async fn empty_run_callback_scores_zero_instead_of_waiting() {
    let h = harness();
    h.machine.start(attempt("att-empty", None)).await.unwrap();

    let done = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-empty", vec![]))
        .await
        .unwrap();

    assert_eq!(done, CallbackDisposition::Completed);
    assert_eq!(step(&h, "att-empty").await, SandboxStep::Aggregated);
    let graded = h.transport.published_on(GRADED);
    assert_eq!(graded.len(), 1);
    assert_eq!(graded[0]["scoreBreakdown"]["rawScore"], 0.0);
    assert_eq!(graded[0]["scoreBreakdown"]["tag"], "none");
    assert_eq!(graded[0]["scoreBreakdown"]["summary"], "0/2 test cases passed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_run_callbacks_emit_once() {
    let h = harness();
    h.machine.start(attempt("att-race", None)).await.unwrap();

    let deliver = |machine: Arc<SandboxMachine>| {
        tokio::spawn(async move {
            machine
                .handle_callback(callback(
                    CallbackKind::Run,
                    "att-race",
                    vec![stdout("2\n"), stdout("4\n")],
                ))
                .await
                .unwrap()
        })
    };
    let (a, b) = tokio::join!(deliver(h.machine.clone()), deliver(h.machine.clone()));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|d| *d == CallbackDisposition::Ignored);

    assert_eq!(
        outcomes,
        vec![CallbackDisposition::Completed, CallbackDisposition::Ignored]
    );
    assert_eq!(h.transport.published_on(GRADED).len(), 1);
    assert_eq!(step(&h, "att-race").await, SandboxStep::Aggregated);
}

#[tokio::test]
async fn build_failure_fails_the_criterion_without_running() {
    let h = harness();
    h.machine.start(attempt("att-4", Some("make"))).await.unwrap();

    let outcome = h
        .machine
        .handle_callback(callback(
            CallbackKind::Init,
            "att-4",
            vec![result(
                JudgeStatus::NonzeroExitStatus,
                2,
                &[("stdout", ""), ("stderr", "main.c:1: error\n")],
            )],
        ))
        .await
        .unwrap();
    assert_eq!(outcome, CallbackDisposition::Completed);
    assert_eq!(h.client.submissions().len(), 1);

    let failed = h.transport.published_on(FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["criterionName"], "Runs");
    assert_eq!(
        failed[0]["error"],
        "Build step failed: Nonzero Exit Status (exit 2): main.c:1: error"
    );

    let record = h.machine.state("att-4").await.unwrap().unwrap();
    assert_eq!(record.step, SandboxStep::Aggregated);
    assert!(record.failure.unwrap().starts_with("Build step failed"));

    // Terminal attempts never move again.
    let late = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "att-4", vec![stdout("2\n"), stdout("4\n")]))
        .await
        .unwrap();
    assert_eq!(late, CallbackDisposition::Ignored);
    assert!(h.transport.published_on(GRADED).is_empty());
}

#[tokio::test]
async fn run_submit_failure_after_init_fails_the_criterion() {
    let h = harness();
    h.machine.start(attempt("att-5", Some("make"))).await.unwrap();
    h.client.fail_submissions(true);

    let outcome = h
        .machine
        .handle_callback(callback(CallbackKind::Init, "att-5", vec![stdout("")]))
        .await
        .unwrap();
    assert_eq!(outcome, CallbackDisposition::Completed);
    assert_eq!(step(&h, "att-5").await, SandboxStep::Aggregated);

    let failed = h.transport.published_on(FAILED);
    assert_eq!(failed.len(), 1);
    assert!(failed[0]["error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn start_submit_failure_leaves_a_terminal_record_and_emits_nothing() {
    let h = harness();
    h.client.fail_submissions(true);

    let err = h.machine.start(attempt("att-6", None)).await.unwrap_err();
    assert!(matches!(err, SandboxError::RemoteStatus { status: 503, .. }));

    let record = h.machine.state("att-6").await.unwrap().unwrap();
    assert_eq!(record.step, SandboxStep::Aggregated);
    assert!(record.failure.unwrap().contains("503"));
    assert!(h.transport.published().is_empty());
}

#[tokio::test]
async fn unknown_attempt_with_identity_is_failed_once() {
    let h = harness();

    let outcome = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "ghost", vec![stdout("2\n")]))
        .await
        .unwrap();
    assert_eq!(outcome, CallbackDisposition::Completed);

    let failed = h.transport.published_on(FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["assessmentId"], "A1");
    assert_eq!(failed[0]["error"], "No cached state found for attempt ghost");

    let tombstone = h.machine.state("ghost").await.unwrap().unwrap();
    assert_eq!(tombstone.step, SandboxStep::Aggregated);
    assert!(tombstone.config.is_none());

    let again = h
        .machine
        .handle_callback(callback(CallbackKind::Run, "ghost", vec![stdout("2\n")]))
        .await
        .unwrap();
    assert_eq!(again, CallbackDisposition::Ignored);
    assert_eq!(h.transport.published_on(FAILED).len(), 1);
}

#[tokio::test]
async fn anonymous_unknown_callbacks_follow_the_policy() {
    let anonymous = |id: &str| Callback {
        kind: CallbackKind::Init,
        attempt_id: id.to_string(),
        assessment_id: None,
        criterion_name: Some("Runs".to_string()),
        results: vec![],
    };

    let drop = harness_with(UnknownCallbackPolicy::Drop);
    let outcome = drop.machine.handle_callback(anonymous("nobody")).await.unwrap();
    assert_eq!(outcome, CallbackDisposition::Dropped);
    assert!(outcome.is_accepted());
    assert!(drop.machine.state("nobody").await.unwrap().is_none());

    let reject = harness_with(UnknownCallbackPolicy::Reject);
    let outcome = reject.machine.handle_callback(anonymous("nobody")).await.unwrap();
    assert_eq!(outcome, CallbackDisposition::Rejected);
    assert!(!outcome.is_accepted());

    assert!(drop.transport.published().is_empty());
    assert!(reject.transport.published().is_empty());
}
