//! Callback-driven state machine for one sandbox attempt.
//!
//! ```text
//! Uploaded ──init ok──▶ Initialized ──run submitted──▶ Running ──all results──▶ Aggregated
//!     │                                                                     ▲
//!     └──────────────── build failed / submit failed ───────────────────────┘
//! ```
//!
//! The attempt lives in the shared [`KvStore`] under `test-runner:<id>`,
//! because callbacks may reach any process instance. Every transition is a
//! compare-and-put on the revision it was read at and re-checks the stored
//! step, so a step never moves backwards and a late or duplicate callback
//! is ignored instead of being applied twice.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gradeflow_state::{KvStore, RecordStore, VersionedRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::error::{SandboxError, SandboxResult};
use super::go_judge::{
    shell_cmd, CallbackKind, CallbackTarget, CmdFile, JudgeRequest, JudgeResult, JudgeStatus, Limits,
    SandboxClient,
};
use crate::domain::{Criterion, FeedbackItem, ScoreBreakdown};
use crate::emitter::ResultEmitter;
use crate::metrics::METRICS;
use crate::obs;
use crate::plugins::config::{RunningSettings, TestRunnerConfig};
use crate::plugins::PluginKind;

const MAX_CAS_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SandboxStep {
    Uploaded,
    Initialized,
    Running,
    Aggregated,
}

impl SandboxStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Aggregated => "aggregated",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Aggregated
    }
}

impl fmt::Display for SandboxStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStateRecord {
    pub attempt_id: String,
    pub assessment_id: String,
    pub criterion: Criterion,
    /// `None` only on tombstones.
    pub config: Option<TestRunnerConfig>,
    pub step: SandboxStep,
    pub processed_count: usize,
    pub total_count: usize,
    #[serde(default)]
    pub results: Vec<JudgeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VersionedRecord for SandboxStateRecord {
    const NAMESPACE: &'static str = "test-runner";
    const VERSION: u32 = 1;
}

/// What to do with a callback whose attempt is unknown and which carries
/// no criterion identity to report a failure against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCallbackPolicy {
    /// Log and acknowledge; the sender will not retry.
    #[default]
    Drop,
    /// Refuse so the sender may redeliver.
    Reject,
}

impl FromStr for UnknownCallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown callback policy: {other} (expected drop or reject)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Directory the judge copies attempt working directories into.
    pub store_dir: PathBuf,
    /// Expiry of attempt records.
    pub state_ttl: Duration,
    pub unknown_callback: UnknownCallbackPolicy,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/dev/shm/go-judge"),
            state_ttl: Duration::from_secs(24 * 60 * 60),
            unknown_callback: UnknownCallbackPolicy::Drop,
        }
    }
}

/// Everything needed to start an attempt.
#[derive(Debug, Clone)]
pub struct StartAttempt {
    pub attempt_id: String,
    pub assessment_id: String,
    pub criterion: Criterion,
    pub config: TestRunnerConfig,
    /// Submission files by sandbox-relative path.
    pub files: BTreeMap<String, String>,
}

/// A callback as received from the judge.
#[derive(Debug, Clone, PartialEq)]
pub struct Callback {
    pub kind: CallbackKind,
    pub attempt_id: String,
    pub assessment_id: Option<String>,
    pub criterion_name: Option<String>,
    pub results: Vec<JudgeResult>,
}

/// How a callback was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDisposition {
    /// The attempt moved to (or stayed in) this step and waits for more.
    Advanced(SandboxStep),
    /// The attempt reached `Aggregated` and its outcome was emitted.
    Completed,
    /// Out of order or duplicate; nothing changed.
    Ignored,
    /// Unknown attempt, acknowledged without effect.
    Dropped,
    /// Unknown attempt, refused.
    Rejected,
}

impl CallbackDisposition {
    /// Whether the sender should consider the callback delivered.
    pub fn is_accepted(self) -> bool {
        self != Self::Rejected
    }
}

enum Update {
    Missing,
    Skipped(SandboxStep),
    Written(SandboxStateRecord),
}

enum RunSource<'a> {
    Memory(&'a BTreeMap<String, String>),
    Store,
}

pub struct SandboxMachine {
    records: RecordStore<SandboxStateRecord>,
    client: Arc<dyn SandboxClient>,
    emitter: Arc<ResultEmitter>,
    settings: SandboxSettings,
}

impl SandboxMachine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        client: Arc<dyn SandboxClient>,
        emitter: Arc<ResultEmitter>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            records: RecordStore::new(kv).with_ttl(settings.state_ttl),
            client,
            emitter,
            settings,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Current record of an attempt.
    pub async fn state(&self, attempt_id: &str) -> SandboxResult<Option<SandboxStateRecord>> {
        Ok(self.records.load(attempt_id).await?.map(|v| v.record))
    }

    /// Persist the attempt as `Uploaded` and submit its first job.
    ///
    /// With an init command the init job is submitted and the attempt waits
    /// for its callback. Without one the attempt is advanced straight to
    /// `Running` and the run job carries the files itself. An `Err` leaves
    /// the attempt terminal; the caller reports the failure.
    #[instrument(skip(self, attempt), fields(attempt_id = %attempt.attempt_id, criterion = %attempt.criterion.criterion_name))]
    pub async fn start(&self, attempt: StartAttempt) -> SandboxResult<SandboxStep> {
        let record = SandboxStateRecord {
            attempt_id: attempt.attempt_id.clone(),
            assessment_id: attempt.assessment_id.clone(),
            criterion: attempt.criterion.clone(),
            total_count: attempt.config.test_cases.len(),
            config: Some(attempt.config.clone()),
            step: SandboxStep::Uploaded,
            processed_count: 0,
            results: Vec::new(),
            failure: None,
            updated_at: Utc::now(),
        };
        self.records.save(&attempt.attempt_id, &record).await?;
        obs::emit_sandbox_transition(&attempt.attempt_id, "none", SandboxStep::Uploaded.as_str());

        let submitted = match attempt.config.init_command() {
            Some(command) => self.submit_init(&record, command, &attempt.files).await,
            None => self.skip_init(&record, &attempt.files).await,
        };
        match submitted {
            Ok(step) => Ok(step),
            Err(e) => {
                self.fail(&attempt.attempt_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn submit_init(
        &self,
        record: &SandboxStateRecord,
        command: &str,
        files: &BTreeMap<String, String>,
    ) -> SandboxResult<SandboxStep> {
        let config = record.config.as_ref().ok_or_else(|| missing_config(record))?;
        let copy_in = files
            .iter()
            .map(|(path, content)| {
                (
                    path.clone(),
                    CmdFile::Memory {
                        content: content.clone(),
                    },
                )
            })
            .collect();
        let cmd = shell_cmd(
            command,
            "",
            &config.environment_variables,
            limits(&config.advanced_settings.init_step),
            copy_in,
            Some(record.attempt_id.clone()),
        );
        self.client
            .submit(&JudgeRequest { cmd: vec![cmd] }, &target(record, CallbackKind::Init))
            .await?;
        Ok(SandboxStep::Uploaded)
    }

    /// The explicit already-initialized branch: no init job exists, so the
    /// attempt passes through `Initialized` without waiting.
    async fn skip_init(
        &self,
        record: &SandboxStateRecord,
        files: &BTreeMap<String, String>,
    ) -> SandboxResult<SandboxStep> {
        let id = &record.attempt_id;
        self.require(self.transition(id, SandboxStep::Uploaded, SandboxStep::Initialized).await?, id)?;
        let running =
            self.require(self.transition(id, SandboxStep::Initialized, SandboxStep::Running).await?, id)?;
        self.submit_run(&running, RunSource::Memory(files)).await?;
        Ok(SandboxStep::Running)
    }

    fn require(&self, update: Update, attempt_id: &str) -> SandboxResult<SandboxStateRecord> {
        match update {
            Update::Written(record) => Ok(record),
            Update::Missing | Update::Skipped(_) => Err(SandboxError::Contended {
                attempt_id: attempt_id.to_string(),
            }),
        }
    }

    async fn submit_run(&self, record: &SandboxStateRecord, source: RunSource<'_>) -> SandboxResult<()> {
        let config = record.config.as_ref().ok_or_else(|| missing_config(record))?;
        let copy_in: BTreeMap<String, CmdFile> = match source {
            RunSource::Memory(files) => files
                .iter()
                .map(|(path, content)| {
                    (
                        path.clone(),
                        CmdFile::Memory {
                            content: content.clone(),
                        },
                    )
                })
                .collect(),
            RunSource::Store => BTreeMap::from([(
                ".".to_string(),
                CmdFile::Local {
                    src: self
                        .settings
                        .store_dir
                        .join(&record.attempt_id)
                        .to_string_lossy()
                        .into_owned(),
                },
            )]),
        };
        let run_limits = limits(&config.advanced_settings.run_step);
        let cmd = config
            .test_cases
            .iter()
            .map(|case| {
                shell_cmd(
                    &config.run_command,
                    &case.input,
                    &config.environment_variables,
                    run_limits,
                    copy_in.clone(),
                    None,
                )
            })
            .collect();
        self.client
            .submit(&JudgeRequest { cmd }, &target(record, CallbackKind::Run))
            .await
    }

    /// Apply a judge callback.
    #[instrument(skip(self, callback), fields(attempt_id = %callback.attempt_id, kind = %callback.kind, results = callback.results.len()))]
    pub async fn handle_callback(&self, callback: Callback) -> SandboxResult<CallbackDisposition> {
        METRICS.inc_sandbox_callbacks();
        let Some(found) = self.records.load(&callback.attempt_id).await? else {
            return self.handle_missing(&callback).await;
        };
        let step = found.record.step;
        let expected = match callback.kind {
            CallbackKind::Init => SandboxStep::Uploaded,
            CallbackKind::Run => SandboxStep::Running,
        };
        if step != expected {
            obs::emit_sandbox_callback_ignored(&callback.attempt_id, step.as_str(), callback.kind.as_str());
            return Ok(CallbackDisposition::Ignored);
        }
        match callback.kind {
            CallbackKind::Init => self.on_init(&callback).await,
            CallbackKind::Run => self.on_run(&callback).await,
        }
    }

    async fn on_init(&self, callback: &Callback) -> SandboxResult<CallbackDisposition> {
        let id = &callback.attempt_id;
        if let Some(reason) = build_failure(&callback.results) {
            return self
                .finish_failed(id, SandboxStep::Uploaded, &format!("Build step failed: {reason}"))
                .await;
        }

        let record = match self.transition(id, SandboxStep::Uploaded, SandboxStep::Initialized).await? {
            Update::Written(record) => record,
            Update::Missing => return self.handle_missing(callback).await,
            Update::Skipped(step) => return Ok(self.ignored(id, step, callback.kind)),
        };
        debug!(attempt_id = %id, criterion = %record.criterion.criterion_name, "build step succeeded");

        // Running is recorded before the run job exists, so its callback can
        // never find the attempt behind.
        let running = match self.transition(id, SandboxStep::Initialized, SandboxStep::Running).await? {
            Update::Written(record) => record,
            Update::Missing => return self.handle_missing(callback).await,
            Update::Skipped(step) => return Ok(self.ignored(id, step, callback.kind)),
        };
        if let Err(e) = self.submit_run(&running, RunSource::Store).await {
            return self.finish_failed(id, SandboxStep::Running, &e.to_string()).await;
        }
        Ok(CallbackDisposition::Advanced(SandboxStep::Running))
    }

    /// The judge answers a batched run once, so the first run callback is
    /// the whole result. Cases it does not cover are scored as missing and
    /// later deliveries find the attempt `Aggregated`.
    async fn on_run(&self, callback: &Callback) -> SandboxResult<CallbackDisposition> {
        let id = &callback.attempt_id;
        let mut score = None;
        let finished = self
            .update(id, |r| {
                if r.step != SandboxStep::Running {
                    return false;
                }
                let Some(config) = r.config.as_ref() else {
                    return false;
                };
                score = Some(aggregate(&r.criterion, config, &callback.results));
                r.results = callback.results.clone();
                r.processed_count = callback.results.len();
                r.step = SandboxStep::Aggregated;
                true
            })
            .await?;
        let done = match finished {
            Update::Written(done) => done,
            Update::Missing => return self.handle_missing(callback).await,
            Update::Skipped(SandboxStep::Running) => {
                // Only a record without configuration is skipped while running.
                let reason = format!("attempt {id} has no configuration");
                return self.finish_failed(id, SandboxStep::Running, &reason).await;
            }
            Update::Skipped(step) => return Ok(self.ignored(id, step, callback.kind)),
        };
        if done.processed_count < done.total_count {
            warn!(attempt_id = %id, received = done.processed_count, expected = done.total_count, "run callback is missing results");
        }
        obs::emit_sandbox_transition(id, SandboxStep::Running.as_str(), SandboxStep::Aggregated.as_str());
        let Some(score) = score else {
            return Err(missing_config(&done));
        };
        self.emitter
            .emit_criterion_graded(&done.assessment_id, score)
            .await
            .map_err(|e| SandboxError::Publish(e.to_string()))?;
        Ok(CallbackDisposition::Completed)
    }

    /// Callback for an attempt with no record. With a criterion identity the
    /// criterion is failed and a tombstone recorded; otherwise the unknown
    /// callback policy applies.
    async fn handle_missing(&self, callback: &Callback) -> SandboxResult<CallbackDisposition> {
        obs::emit_sandbox_callback_unknown(&callback.attempt_id, callback.kind.as_str());
        let (Some(assessment_id), Some(criterion_name)) =
            (callback.assessment_id.as_deref(), callback.criterion_name.as_deref())
        else {
            return Ok(match self.settings.unknown_callback {
                UnknownCallbackPolicy::Drop => CallbackDisposition::Dropped,
                UnknownCallbackPolicy::Reject => CallbackDisposition::Rejected,
            });
        };

        let reason = format!("No cached state found for attempt {}", callback.attempt_id);
        let tombstone = SandboxStateRecord {
            attempt_id: callback.attempt_id.clone(),
            assessment_id: assessment_id.to_string(),
            criterion: Criterion {
                criterion_name: criterion_name.to_string(),
                file_refs: Vec::new(),
                levels: Vec::new(),
                plugin: PluginKind::TestRunner.id().to_string(),
                configuration: String::new(),
            },
            config: None,
            step: SandboxStep::Aggregated,
            processed_count: 0,
            total_count: 0,
            results: Vec::new(),
            failure: Some(reason.clone()),
            updated_at: Utc::now(),
        };
        self.records.save(&callback.attempt_id, &tombstone).await?;
        self.emitter
            .emit_criterion_failed(assessment_id, criterion_name, &reason)
            .await
            .map_err(|e| SandboxError::Publish(e.to_string()))?;
        Ok(CallbackDisposition::Completed)
    }

    /// Move the attempt from `from` straight to `Aggregated` with a failure
    /// and report it.
    async fn finish_failed(
        &self,
        attempt_id: &str,
        from: SandboxStep,
        reason: &str,
    ) -> SandboxResult<CallbackDisposition> {
        let written = self
            .update(attempt_id, |r| {
                if r.step != from {
                    return false;
                }
                r.step = SandboxStep::Aggregated;
                r.failure = Some(reason.to_string());
                true
            })
            .await?;
        match written {
            Update::Written(record) => {
                obs::emit_sandbox_transition(attempt_id, from.as_str(), SandboxStep::Aggregated.as_str());
                self.emitter
                    .emit_criterion_failed(&record.assessment_id, &record.criterion.criterion_name, reason)
                    .await
                    .map_err(|e| SandboxError::Publish(e.to_string()))?;
                Ok(CallbackDisposition::Completed)
            }
            Update::Missing => Ok(CallbackDisposition::Dropped),
            Update::Skipped(step) => Ok(self.ignored(attempt_id, step, "failure")),
        }
    }

    /// Mark a started attempt terminal without emitting; used when `start`
    /// itself fails and the dispatcher reports the criterion.
    async fn fail(&self, attempt_id: &str, reason: &str) {
        let result = self
            .update(attempt_id, |r| {
                if r.step.is_terminal() {
                    return false;
                }
                r.step = SandboxStep::Aggregated;
                r.failure = Some(reason.to_string());
                true
            })
            .await;
        if let Err(e) = result {
            warn!(attempt_id = %attempt_id, error = %e, "failed to mark attempt as failed");
        }
    }

    fn ignored(&self, attempt_id: &str, step: SandboxStep, callback: impl fmt::Display) -> CallbackDisposition {
        obs::emit_sandbox_callback_ignored(attempt_id, step.as_str(), &callback.to_string());
        CallbackDisposition::Ignored
    }

    async fn transition(&self, attempt_id: &str, from: SandboxStep, to: SandboxStep) -> SandboxResult<Update> {
        let update = self
            .update(attempt_id, |r| {
                if r.step != from {
                    return false;
                }
                r.step = to;
                true
            })
            .await?;
        if matches!(update, Update::Written(_)) {
            obs::emit_sandbox_transition(attempt_id, from.as_str(), to.as_str());
        }
        Ok(update)
    }

    /// Read-modify-write with compare-and-put. `apply` returns `false` when
    /// the stored record is not in a state it applies to.
    async fn update<F>(&self, attempt_id: &str, mut apply: F) -> SandboxResult<Update>
    where
        F: FnMut(&mut SandboxStateRecord) -> bool,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(found) = self.records.load(attempt_id).await? else {
                return Ok(Update::Missing);
            };
            let mut record = found.record;
            let step = record.step;
            if !apply(&mut record) {
                return Ok(Update::Skipped(step));
            }
            record.updated_at = Utc::now();
            if self.records.save_if(attempt_id, found.revision, &record).await? {
                return Ok(Update::Written(record));
            }
            debug!(attempt_id = %attempt_id, "attempt record changed underneath, retrying");
        }
        Err(SandboxError::Contended {
            attempt_id: attempt_id.to_string(),
        })
    }
}

fn target(record: &SandboxStateRecord, kind: CallbackKind) -> CallbackTarget {
    CallbackTarget {
        kind,
        attempt_id: record.attempt_id.clone(),
        assessment_id: record.assessment_id.clone(),
        criterion_name: record.criterion.criterion_name.clone(),
    }
}

fn limits(settings: &RunningSettings) -> Limits {
    Limits {
        cpu_limit: settings.cpu_limit,
        clock_limit: settings.clock_limit,
        memory_limit: settings.memory_limit,
        proc_limit: settings.proc_limit,
    }
}

fn missing_config(record: &SandboxStateRecord) -> SandboxError {
    SandboxError::InvalidConfig(format!("attempt {} has no configuration", record.attempt_id))
}

/// Why the init job failed, if it did.
fn build_failure(results: &[JudgeResult]) -> Option<String> {
    if results.is_empty() {
        return Some("no result returned".to_string());
    }
    let failed = results.iter().find(|r| !r.succeeded())?;
    let detail = failed
        .error
        .as_deref()
        .or(failed.stderr())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(match detail {
        Some(detail) => format!("{} (exit {}): {detail}", failed.status, failed.exit_status),
        None => format!("{} (exit {})", failed.status, failed.exit_status),
    })
}

/// Score a finished run. Each case passes when the judge accepted it, stdout
/// was collected and it matches the expected output under the configured
/// comparison.
pub fn aggregate(criterion: &Criterion, config: &TestRunnerConfig, results: &[JudgeResult]) -> ScoreBreakdown {
    struct Case {
        index: usize,
        passed: bool,
        status: String,
        detail: serde_json::Value,
    }

    let mut cases: Vec<Case> = config
        .test_cases
        .iter()
        .enumerate()
        .map(|(index, case)| {
            let result = results.get(index);
            let actual = result.and_then(JudgeResult::stdout);
            let passed = result.is_some_and(|r| r.status == JudgeStatus::Accepted)
                && actual.is_some_and(|a| config.output_comparison.matches(&case.output, a));
            let status = match (result, actual) {
                (None, _) => "No result".to_string(),
                (Some(_), None) => "No output".to_string(),
                (Some(r), Some(_)) if r.status != JudgeStatus::Accepted => r.status.to_string(),
                (Some(_), Some(_)) if passed => "Passed".to_string(),
                _ => "Wrong Answer".to_string(),
            };
            let detail = serde_json::json!({
                "index": index + 1,
                "description": case.description,
                "input": case.input,
                "expected": case.output,
                "actual": actual,
                "status": status,
                "passed": passed,
            });
            Case {
                index,
                passed,
                status,
                detail,
            }
        })
        .collect();
    // Failing cases first, original order within each group.
    cases.sort_by_key(|c| c.passed);

    let total = cases.len();
    let passed = cases.iter().filter(|c| c.passed).count();
    // Whole percentages, like level weights.
    let raw_score = if total == 0 {
        0.0
    } else {
        (100.0 * passed as f64 / total as f64).round()
    };
    let tag = criterion
        .level_for_score(raw_score)
        .map(|level| level.tag.clone())
        .unwrap_or_default();

    let feedback_items = cases
        .iter()
        .map(|c| {
            let label = config.test_cases[c.index]
                .description
                .as_deref()
                .map(|d| format!("Test case {} ({d})", c.index + 1))
                .unwrap_or_else(|| format!("Test case {}", c.index + 1));
            if c.passed {
                FeedbackItem::note("passed", format!("{label} passed"))
            } else {
                FeedbackItem::note("failed", format!("{label} failed: {}", c.status))
            }
        })
        .collect();

    ScoreBreakdown {
        criterion_name: criterion.criterion_name.clone(),
        tag,
        raw_score,
        plugin: PluginKind::TestRunner.id().to_string(),
        summary: Some(format!("{passed}/{total} test cases passed")),
        metadata: Some(serde_json::json!({
            "testCases": cases.into_iter().map(|c| c.detail).collect::<Vec<_>>(),
        })),
        feedback_items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Level;
    use crate::plugins::config::TestCase;
    use crate::sandbox::compare::OutputComparison;

    fn criterion() -> Criterion {
        Criterion {
            criterion_name: "Runs".to_string(),
            file_refs: vec![],
            levels: [0, 50, 100]
                .iter()
                .map(|w| Level {
                    tag: format!("L{w}"),
                    description: String::new(),
                    weight: *w,
                })
                .collect(),
            plugin: "test-runner".to_string(),
            configuration: String::new(),
        }
    }

    fn config(outputs: &[&str]) -> TestRunnerConfig {
        TestRunnerConfig {
            kind: "test-runner".to_string(),
            version: 1,
            run_command: "python main.py".to_string(),
            init_command: None,
            test_cases: outputs
                .iter()
                .map(|o| TestCase {
                    input: String::new(),
                    output: o.to_string(),
                    description: None,
                })
                .collect(),
            environment_variables: BTreeMap::new(),
            output_comparison: OutputComparison {
                trim: true,
                ..OutputComparison::default()
            },
            advanced_settings: Default::default(),
        }
    }

    fn result(status: JudgeStatus, stdout: Option<&str>) -> JudgeResult {
        JudgeResult {
            status,
            error: None,
            exit_status: 0,
            time: 0,
            memory: 0,
            run_time: 0,
            files: stdout
                .map(|s| BTreeMap::from([("stdout".to_string(), s.to_string())]))
                .unwrap_or_default(),
        }
    }

    #[test]
    fn steps_are_ordered() {
        assert!(SandboxStep::Uploaded < SandboxStep::Initialized);
        assert!(SandboxStep::Running < SandboxStep::Aggregated);
        assert!(SandboxStep::Aggregated.is_terminal());
    }

    #[test]
    fn aggregate_scores_and_orders_failures_first() {
        let results = vec![
            result(JudgeStatus::Accepted, Some("1\n")),
            result(JudgeStatus::Accepted, None),
            result(JudgeStatus::TimeLimitExceeded, Some("3")),
            result(JudgeStatus::Accepted, Some("4")),
        ];
        let score = aggregate(&criterion(), &config(&["1", "2", "3", "4"]), &results);
        assert_eq!(score.raw_score, 50.0);
        assert_eq!(score.tag, "L50");
        assert_eq!(score.summary.as_deref(), Some("2/4 test cases passed"));
        assert_eq!(score.feedback_items[0].tag, "failed");
        assert_eq!(score.feedback_items[0].comment, "Test case 2 failed: No output");
        assert_eq!(score.feedback_items[1].comment, "Test case 3 failed: Time Limit Exceeded");
        assert_eq!(score.feedback_items[3].tag, "passed");

        let cases = &score.metadata.unwrap()["testCases"];
        assert_eq!(cases[0]["expected"], "2");
        assert_eq!(cases[0]["actual"], serde_json::Value::Null);
        assert_eq!(cases[3]["actual"], "4");
    }

    #[test]
    fn missing_results_fail_their_cases() {
        let score = aggregate(&criterion(), &config(&["1", "2"]), &[result(JudgeStatus::Accepted, Some("1"))]);
        assert_eq!(score.raw_score, 50.0);
        assert!(score.feedback_items[0].comment.ends_with("No result"));
    }

    #[test]
    fn build_failure_reports_stderr() {
        let mut failed = result(JudgeStatus::NonzeroExitStatus, None);
        failed.exit_status = 2;
        failed.files.insert("stderr".to_string(), "syntax error\n".to_string());
        assert_eq!(
            build_failure(&[failed]).as_deref(),
            Some("Nonzero Exit Status (exit 2): syntax error")
        );
        assert!(build_failure(&[result(JudgeStatus::Accepted, Some(""))]).is_none());
        assert!(build_failure(&[]).is_some());
    }

    #[test]
    fn unknown_callback_policy_parses() {
        assert_eq!("reject".parse::<UnknownCallbackPolicy>().unwrap(), UnknownCallbackPolicy::Reject);
        assert!("retry".parse::<UnknownCallbackPolicy>().is_err());
        assert!(!CallbackDisposition::Rejected.is_accepted());
        assert!(CallbackDisposition::Dropped.is_accepted());
    }

    #[test]
    fn raw_score_is_a_whole_percentage() {
        let results = vec![
            result(JudgeStatus::Accepted, Some("2")),
            result(JudgeStatus::Accepted, Some("x")),
            result(JudgeStatus::Accepted, Some("x")),
        ];
        let score = aggregate(&criterion(), &config(&["2", "4", "6"]), &results);
        assert_eq!(score.raw_score, 33.0);
        assert_eq!(score.tag, "L0");

        let two_of_three = aggregate(
            &criterion(),
            &config(&["2", "4", "6"]),
            &[
                result(JudgeStatus::Accepted, Some("2")),
                result(JudgeStatus::Accepted, Some("4")),
            ],
        );
        assert_eq!(two_of_three.raw_score, 67.0);
        assert_eq!(two_of_three.tag, "L50");
    }
}
