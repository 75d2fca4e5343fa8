//! go-judge sandbox service binding.
//!
//! Jobs are posted to `POST <judge>/run?callback=<url>`; the judge answers
//! immediately and later posts the per-command results to the callback
//! URL, which routes back into the [`SandboxMachine`](super::machine::SandboxMachine).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::error::{SandboxError, SandboxResult};
use super::execution::{execute_with_controls, CircuitBreaker, ExecutionControls};

/// Cap for the stdout and stderr collectors (1 MiB each).
pub const OUTPUT_CAP: u64 = 1024 * 1024;
const DEFAULT_PATH: &str = "/usr/bin:/bin";
const CALLBACK_PATH: &str = "/api/v1/plugins/test-runner/callback";

/// A file slot in a command's fd table or `copyIn` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CmdFile {
    Memory { content: String },
    Collector { name: String, max: u64 },
    Local { src: String },
    Prepared {
        #[serde(rename = "fileId")]
        file_id: String,
    },
}

/// One command in a judge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<CmdFile>,
    pub cpu_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_limit: Option<u64>,
    pub memory_limit: u64,
    pub proc_limit: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub copy_in: BTreeMap<String, CmdFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_out_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub cmd: Vec<Cmd>,
}

/// Resource limits for one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub cpu_limit: u64,
    pub clock_limit: Option<u64>,
    pub memory_limit: u64,
    pub proc_limit: u32,
}

/// Builds a shell command with stdin, stdout and stderr wired up.
pub fn shell_cmd(
    command: &str,
    stdin: &str,
    env: &BTreeMap<String, String>,
    limits: Limits,
    copy_in: BTreeMap<String, CmdFile>,
    copy_out_dir: Option<String>,
) -> Cmd {
    let mut vars = vec![format!("PATH={DEFAULT_PATH}")];
    vars.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
    Cmd {
        args: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("rm stdout stderr &> /dev/null; {command}"),
        ],
        env: vars,
        files: vec![
            CmdFile::Memory {
                content: stdin.to_string(),
            },
            CmdFile::Collector {
                name: "stdout".to_string(),
                max: OUTPUT_CAP,
            },
            CmdFile::Collector {
                name: "stderr".to_string(),
                max: OUTPUT_CAP,
            },
        ],
        cpu_limit: limits.cpu_limit,
        clock_limit: limits.clock_limit,
        memory_limit: limits.memory_limit,
        proc_limit: limits.proc_limit,
        copy_in,
        copy_out_dir,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgeStatus {
    Accepted,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Output Limit Exceeded")]
    OutputLimitExceeded,
    #[serde(rename = "File Error")]
    FileError,
    #[serde(rename = "Nonzero Exit Status")]
    NonzeroExitStatus,
    Signalled,
    #[serde(rename = "Internal Error")]
    InternalError,
}

impl fmt::Display for JudgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Accepted => "Accepted",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::OutputLimitExceeded => "Output Limit Exceeded",
            Self::FileError => "File Error",
            Self::NonzeroExitStatus => "Nonzero Exit Status",
            Self::Signalled => "Signalled",
            Self::InternalError => "Internal Error",
        };
        f.write_str(label)
    }
}

/// Result of one command, as posted to the callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub status: JudgeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_status: i32,
    /// CPU time, ns.
    #[serde(default)]
    pub time: u64,
    /// Peak memory, bytes.
    #[serde(default)]
    pub memory: u64,
    /// Wall clock time, ns.
    #[serde(default)]
    pub run_time: u64,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl JudgeResult {
    pub fn stdout(&self) -> Option<&str> {
        self.files.get("stdout").map(String::as_str)
    }

    pub fn stderr(&self) -> Option<&str> {
        self.files.get("stderr").map(String::as_str)
    }

    pub fn succeeded(&self) -> bool {
        self.status == JudgeStatus::Accepted && self.exit_status == 0
    }
}

/// Which job a callback reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    Init,
    Run,
}

impl CallbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "run" => Ok(Self::Run),
            other => Err(format!("unknown callback type: {other}")),
        }
    }
}

/// Identity carried by a callback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    pub kind: CallbackKind,
    pub attempt_id: String,
    pub assessment_id: String,
    pub criterion_name: String,
}

impl CallbackTarget {
    /// `<self_url>/api/v1/plugins/test-runner/callback?type=..&id=..&assessment=..&criterion=..`
    pub fn callback_url(&self, self_url: &str) -> SandboxResult<String> {
        let mut url = url::Url::parse(&format!(
            "{}{}",
            self_url.trim_end_matches('/'),
            CALLBACK_PATH
        ))
        .map_err(|e| SandboxError::InvalidConfig(format!("invalid self URL {self_url}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("type", self.kind.as_str())
            .append_pair("id", &self.attempt_id)
            .append_pair("assessment", &self.assessment_id)
            .append_pair("criterion", &self.criterion_name);
        Ok(url.into())
    }
}

/// Submits jobs to the sandbox service.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Submit `request`; results arrive later at `target`'s callback URL.
    async fn submit(&self, request: &JudgeRequest, target: &CallbackTarget) -> SandboxResult<()>;
}

pub struct GoJudgeClient {
    http: reqwest::Client,
    judge_url: String,
    self_url: String,
    controls: ExecutionControls,
    breaker: CircuitBreaker,
}

impl GoJudgeClient {
    pub fn new(judge_url: &str, self_url: &str, controls: ExecutionControls) -> Self {
        Self {
            http: reqwest::Client::new(),
            judge_url: judge_url.trim_end_matches('/').to_string(),
            self_url: self_url.to_string(),
            breaker: CircuitBreaker::new(controls.breaker_threshold),
            controls,
        }
    }

    pub fn run_url(&self, target: &CallbackTarget) -> SandboxResult<String> {
        let callback = target.callback_url(&self.self_url)?;
        let mut url = url::Url::parse(&format!("{}/run", self.judge_url))
            .map_err(|e| SandboxError::InvalidConfig(format!("invalid judge URL: {e}")))?;
        url.query_pairs_mut().append_pair("callback", &callback);
        Ok(url.into())
    }
}

#[async_trait]
impl SandboxClient for GoJudgeClient {
    #[instrument(skip(self, request), fields(attempt_id = %target.attempt_id, kind = %target.kind, commands = request.cmd.len()))]
    async fn submit(&self, request: &JudgeRequest, target: &CallbackTarget) -> SandboxResult<()> {
        let url = self.run_url(target)?;
        execute_with_controls(&self.controls, &self.breaker, || {
            let url = url.clone();
            async move {
                let response = self
                    .http
                    .post(&url)
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| SandboxError::Http(e.to_string()))?;
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let body = response.text().await.unwrap_or_default();
                Err(SandboxError::RemoteStatus {
                    status: status.as_u16(),
                    body,
                })
            }
        })
        .await?;
        debug!("job submitted");
        Ok(())
    }
}
