//! Criterion dispatcher tests: partitioning, group failure fan-out and the
//! one-outcome-per-criterion invariant.

use std::sync::Arc;

use gradeflow_core::bundler::{Bundler, BundlerConfig};
use gradeflow_core::fakes::{MemoryFileStore, ScriptedActionCaller, ScriptedGradingModel};
use gradeflow_core::plugins::ai::AiGrader;
use gradeflow_core::plugins::remote::RemotePlugin;
use gradeflow_core::{
    Criterion, CriterionOutcome, Dispatcher, GradingRequest, Level, Plugin, PluginKind,
    PluginRegistry,
};
use gradeflow_state::fakes::MemoryKvStore;
use tempfile::TempDir;

const STATIC_ANALYSIS: &str = r#"{"type":"static-analysis","preset":{"type":"python"}}"#;

fn criterion(name: &str, plugin: &str, configuration: &str, file_refs: &[&str]) -> Criterion {
    Criterion {
        criterion_name: name.to_string(),
        file_refs: file_refs.iter().map(|f| f.to_string()).collect(),
        levels: vec![
            Level {
                tag: "full".to_string(),
                description: "Everything".to_string(),
                weight: 100,
            },
            Level {
                tag: "none".to_string(),
                description: "Nothing".to_string(),
                weight: 0,
            },
        ],
        plugin: plugin.to_string(),
        configuration: configuration.to_string(),
    }
}

fn request(criteria: Vec<Criterion>) -> GradingRequest {
    GradingRequest {
        assessment_id: "A1".to_string(),
        criteria,
        attachments: vec![],
        metadata: Default::default(),
    }
}

struct Fixture {
    temp: TempDir,
    kv: Arc<MemoryKvStore>,
    store: Arc<MemoryFileStore>,
    model: Arc<ScriptedGradingModel>,
    caller: Arc<ScriptedActionCaller>,
    registry: PluginRegistry,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryFileStore::new("submissions-store"));
    store.insert("f1", "fn main() {}\n");
    store.insert("f2", "print(1)\n");
    let kv = Arc::new(MemoryKvStore::new());
    let bundler = Arc::new(Bundler::new(
        kv.clone(),
        store.clone(),
        BundlerConfig {
            temp_root: temp.path().to_path_buf(),
            ..BundlerConfig::default()
        },
    ));
    let model = Arc::new(ScriptedGradingModel::new());
    let caller = Arc::new(ScriptedActionCaller::new());
    let registry = PluginRegistry::new()
        .with_plugin(Plugin::Ai(AiGrader::new(bundler, model.clone())))
        .with_plugin(Plugin::StaticAnalysis(RemotePlugin::new(
            PluginKind::StaticAnalysis,
            caller.clone(),
        )))
        .with_plugin(Plugin::TypeCoverage(RemotePlugin::new(
            PluginKind::TypeCoverage,
            caller.clone(),
        )));
    Fixture {
        temp,
        kv,
        store,
        model,
        caller,
        registry,
    }
}

fn names(outcomes: &[CriterionOutcome]) -> Vec<&str> {
    outcomes.iter().map(|o| o.criterion_name()).collect()
}

#[tokio::test]
async fn group_invocation_failure_fails_every_criterion_in_it() {
    let fx = fixture();
    fx.caller.fail_with("connection reset by peer");
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("S1", "static-analysis", STATIC_ANALYSIS, &["f2"]),
            criterion("S2", "static-analysis", STATIC_ANALYSIS, &["f2"]),
            criterion("S3", "static-analysis", STATIC_ANALYSIS, &["f2"]),
            criterion("AI", "ai", "", &["f1"]),
        ]))
        .await;

    assert_eq!(outcomes.len(), 4);
    assert_eq!(names(&outcomes), vec!["S1", "S2", "S3", "AI"]);
    for outcome in &outcomes[..3] {
        assert_eq!(
            outcome,
            &CriterionOutcome::failed(
                outcome.criterion_name(),
                "plugin invocation failed: connection reset by peer"
            )
        );
    }
    assert!(matches!(outcomes[3], CriterionOutcome::Graded(_)));
}

#[tokio::test]
async fn unknown_and_disabled_plugins_are_unsupported() {
    let mut fx = fixture();
    fx.registry.set_enabled(PluginKind::TypeCoverage, false);
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("U", "unknown-plugin", "", &[]),
            criterion("T", "type-coverage", r#"{"type":"type-coverage"}"#, &[]),
            criterion("R", "test-runner", "", &[]),
        ]))
        .await;

    assert_eq!(
        outcomes,
        vec![
            CriterionOutcome::failed("U", "Unsupported plugin 'unknown-plugin'"),
            CriterionOutcome::failed("T", "Unsupported plugin 'type-coverage'"),
            CriterionOutcome::failed("R", "Unsupported plugin 'test-runner'"),
        ]
    );
    assert!(fx.caller.calls().is_empty());
}

#[tokio::test]
async fn failed_remote_call_keeps_configuration_errors() {
    let fx = fixture();
    fx.caller.fail_with("connection reset by peer");
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("Bad", "static-analysis", r#"{"type":"static-analysis"}"#, &[]),
            criterion("Good", "static-analysis", STATIC_ANALYSIS, &[]),
        ]))
        .await;

    assert_eq!(names(&outcomes), vec!["Bad", "Good"]);
    match &outcomes[0] {
        CriterionOutcome::Failed { errors, .. } => {
            assert!(errors[0].starts_with("Invalid configuration:"), "{errors:?}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        outcomes[1],
        CriterionOutcome::failed("Good", "plugin invocation failed: connection reset by peer")
    );
}

#[tokio::test]
async fn invalid_configuration_fails_only_that_criterion() {
    let fx = fixture();
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("Bad", "static-analysis", r#"{"type":"static-analysis"}"#, &[]),
            criterion("Good", "static-analysis", STATIC_ANALYSIS, &[]),
        ]))
        .await;

    assert_eq!(names(&outcomes), vec!["Bad", "Good"]);
    match &outcomes[0] {
        CriterionOutcome::Failed { errors, .. } => {
            assert!(errors[0].starts_with("Invalid configuration:"), "{errors:?}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(outcomes[1], CriterionOutcome::Graded(_)));

    let calls = fx.caller.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "static-analysis");
    assert_eq!(calls[0].1.criterion_data_list.len(), 1);
}

#[tokio::test]
async fn ai_grades_each_bundle_once_and_reports_missing_grades() {
    let fx = fixture();
    fx.model.omit("C3");
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("C1", "ai", "", &["f1", "f2"]),
            criterion("C2", "ai", "", &["f2", "f1"]),
            criterion("C3", "ai", "", &["f2"]),
        ]))
        .await;

    assert_eq!(names(&outcomes), vec!["C1", "C2", "C3"]);
    match &outcomes[0] {
        CriterionOutcome::Graded(score) => {
            assert_eq!(score.tag, "full");
            assert_eq!(score.raw_score, 100.0);
            assert_eq!(score.plugin, "ai");
        }
        other => panic!("expected grade, got {other:?}"),
    }
    assert!(matches!(outcomes[1], CriterionOutcome::Graded(_)));
    assert_eq!(outcomes[2], CriterionOutcome::failed("C3", "No grading result returned"));

    let requests = fx.model.requests();
    assert_eq!(requests.len(), 2);
    let shared = requests
        .iter()
        .find(|r| r.criteria.len() == 2)
        .expect("one bundle for the shared path set");
    assert!(shared.content.contains("<file path=\"f1\">"));
}

#[tokio::test]
async fn concurrent_ai_calls_for_one_assessment_each_clean_up() {
    let fx = fixture();
    let temp_root = fx.temp.path().to_path_buf();
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(fx.registry)));
    let first = request(vec![criterion("C1", "ai", "", &["f1", "f2"])]);
    let second = request(vec![criterion("C2", "ai", "", &["f1"])]);

    let (a, b) = tokio::join!(dispatcher.dispatch(&first), dispatcher.dispatch(&second));

    assert!(matches!(a[0], CriterionOutcome::Graded(_)), "{a:?}");
    assert!(matches!(b[0], CriterionOutcome::Graded(_)), "{b:?}");
    assert_eq!(fx.store.download_count("f1"), 2);
    assert!(fx.kv.is_empty());
    assert_eq!(std::fs::read_dir(&temp_root).unwrap().count(), 0);
}

#[tokio::test]
async fn model_failure_fails_only_ai_criteria() {
    let fx = fixture();
    fx.model.fail_with("rate limited");
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("C1", "ai", "", &["f1"]),
            criterion("S1", "static-analysis", STATIC_ANALYSIS, &["f2"]),
        ]))
        .await;

    assert_eq!(
        outcomes[0],
        CriterionOutcome::failed("C1", "plugin invocation failed: rate limited")
    );
    assert!(matches!(outcomes[1], CriterionOutcome::Graded(_)));
}

#[tokio::test]
async fn ai_download_failure_fails_the_whole_group() {
    let fx = fixture();
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));

    let outcomes = dispatcher
        .dispatch(&request(vec![
            criterion("C1", "ai", "", &["f1"]),
            criterion("C2", "ai", "", &["missing"]),
        ]))
        .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(CriterionOutcome::is_failure));
    let CriterionOutcome::Failed { errors, .. } = &outcomes[0] else {
        panic!("expected failure");
    };
    assert!(errors[0].contains("missing"), "{errors:?}");
}

#[tokio::test]
async fn empty_request_yields_no_outcomes() {
    let fx = fixture();
    let dispatcher = Dispatcher::new(Arc::new(fx.registry));
    assert!(dispatcher.dispatch(&request(vec![])).await.is_empty());
}
