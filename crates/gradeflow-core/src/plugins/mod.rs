//! Plugin registry.
//!
//! The set of plugin kinds is closed: [`PluginKind`] enumerates them and
//! [`Plugin`] carries one strongly typed implementation per kind. Runtime
//! identifiers still arrive as strings, so [`PluginRegistry::resolve`]
//! reports unknown, disabled or unconfigured ids as unsupported.

pub mod ai;
pub mod config;
pub mod remote;
pub mod test_runner;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::bundler::BundleError;
use crate::domain::{Criterion, CriterionOutcome, GradingRequest};
use ai::AiGrader;
use remote::RemotePlugin;
use test_runner::TestRunnerPlugin;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin invocation failed: {0}")]
    Invocation(String),

    #[error("plugin service returned {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    Ai,
    TestRunner,
    StaticAnalysis,
    TypeCoverage,
}

impl PluginKind {
    pub const ALL: [PluginKind; 4] = [
        PluginKind::Ai,
        PluginKind::TestRunner,
        PluginKind::StaticAnalysis,
        PluginKind::TypeCoverage,
    ];

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::TestRunner => "test-runner",
            Self::StaticAnalysis => "static-analysis",
            Self::TypeCoverage => "type-coverage",
        }
    }

    pub fn enabled_by_default(self) -> bool {
        !matches!(self, Self::TestRunner)
    }

    /// Display metadata for listings.
    pub fn info(self) -> PluginInfo {
        let (name, description, categories): (&str, &str, &[&str]) = match self {
            Self::Ai => (
                "AI grader",
                "Grade rubric using AI language models",
                &["ai", "general"][..],
            ),
            Self::TestRunner => ("Test Runner", "Run tests on submissions", &["code"][..]),
            Self::StaticAnalysis => (
                "Static Analysis",
                "Using Semgrep to run static analysis on submissions",
                &["code"][..],
            ),
            Self::TypeCoverage => (
                "Type Coverage",
                "Check type coverage in TypeScript projects",
                &["code"][..],
            ),
        };
        PluginInfo {
            id: self.id(),
            name,
            description,
            categories: categories.to_vec(),
            enabled: self.enabled_by_default(),
            configurable: !matches!(self, Self::Ai),
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub categories: Vec<&'static str>,
    pub enabled: bool,
    /// Whether criteria carry a configuration document for this plugin.
    pub configurable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginCategory {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub fn categories() -> Vec<PluginCategory> {
    vec![
        PluginCategory {
            id: "general",
            name: "General",
            description: "General purpose plugins",
        },
        PluginCategory {
            id: "ai",
            name: "AI",
            description: "Plugins utilizing AI models",
        },
        PluginCategory {
            id: "code",
            name: "Code",
            description: "Code related plugins",
        },
    ]
}

/// One grader implementation per kind.
pub enum Plugin {
    Ai(AiGrader),
    TestRunner(TestRunnerPlugin),
    StaticAnalysis(RemotePlugin),
    TypeCoverage(RemotePlugin),
}

impl Plugin {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Ai(_) => PluginKind::Ai,
            Self::TestRunner(_) => PluginKind::TestRunner,
            Self::StaticAnalysis(_) => PluginKind::StaticAnalysis,
            Self::TypeCoverage(_) => PluginKind::TypeCoverage,
        }
    }

    /// Grade `criteria` (all assigned to this plugin) of `request`.
    ///
    /// `Err` means the invocation as a whole failed; per-criterion problems
    /// are returned as failure outcomes instead.
    pub async fn invoke(
        &self,
        request: &GradingRequest,
        criteria: &[Criterion],
    ) -> PluginResult<Vec<CriterionOutcome>> {
        match self {
            Self::Ai(grader) => grader.grade(request, criteria).await,
            Self::TestRunner(runner) => runner.grade(request, criteria).await,
            Self::StaticAnalysis(remote) | Self::TypeCoverage(remote) => {
                remote.grade(request, criteria).await
            }
        }
    }
}

/// Why a plugin id cannot be used.
pub fn unsupported_message(id: &str) -> String {
    format!("Unsupported plugin '{id}'")
}

pub struct PluginRegistry {
    plugins: HashMap<PluginKind, Plugin>,
    enabled: HashSet<PluginKind>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Empty registry with the default enabled flags.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            enabled: PluginKind::ALL
                .into_iter()
                .filter(|k| k.enabled_by_default())
                .collect(),
        }
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.insert(plugin.kind(), plugin);
        self
    }

    pub fn set_enabled(&mut self, kind: PluginKind, enabled: bool) {
        if enabled {
            self.enabled.insert(kind);
        } else {
            self.enabled.remove(&kind);
        }
    }

    /// Replace the enabled set with exactly `kinds`.
    pub fn enable_only(&mut self, kinds: &[PluginKind]) {
        self.enabled = kinds.iter().copied().collect();
    }

    pub fn is_enabled(&self, kind: PluginKind) -> bool {
        self.enabled.contains(&kind)
    }

    /// The plugin for `id`, or the unsupported-plugin message.
    pub fn resolve(&self, id: &str) -> Result<&Plugin, String> {
        PluginKind::from_id(id)
            .filter(|kind| self.is_enabled(*kind))
            .and_then(|kind| self.plugins.get(&kind))
            .ok_or_else(|| unsupported_message(id))
    }

    /// Listing for every kind, with the effective enabled flag.
    pub fn list(&self) -> Vec<PluginInfo> {
        PluginKind::ALL
            .into_iter()
            .map(|kind| PluginInfo {
                enabled: self.is_enabled(kind) && self.plugins.contains_key(&kind),
                ..kind.info()
            })
            .collect()
    }
}
