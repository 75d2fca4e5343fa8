//! Typed plugin configuration documents.
//!
//! A criterion carries its plugin configuration as a JSON string. Each
//! configurable plugin parses it into one of the structs below and runs
//! [`PluginConfig::validate`]; any failure becomes
//! `Invalid configuration: <reason>` for that criterion alone.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::PluginError;
use crate::sandbox::compare::OutputComparison;

/// Shared contract of configuration documents.
pub trait PluginConfig: DeserializeOwned {
    /// Value of the `type` discriminator.
    const TYPE: &'static str;

    fn kind(&self) -> &str;
    fn version(&self) -> u32;

    /// Checks beyond the document shape.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if self.kind() != Self::TYPE {
            return Err(format!(
                "expected type \"{}\", got \"{}\"",
                Self::TYPE,
                self.kind()
            ));
        }
        if self.version() != 1 {
            return Err(format!("unsupported version {}", self.version()));
        }
        self.check()
    }
}

/// Parse and validate a criterion's configuration string.
pub fn parse_config<C: PluginConfig>(raw: &str) -> Result<C, PluginError> {
    let config: C =
        serde_json::from_str(raw).map_err(|e| PluginError::InvalidConfig(e.to_string()))?;
    config.validate().map_err(PluginError::InvalidConfig)?;
    Ok(config)
}

fn default_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// test-runner
// ---------------------------------------------------------------------------

/// Sandbox limits for one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunningSettings {
    /// CPU time, ns.
    pub cpu_limit: u64,
    /// Wall clock time, ns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_limit: Option<u64>,
    /// Bytes.
    pub memory_limit: u64,
    pub proc_limit: u32,
}

impl Default for RunningSettings {
    fn default() -> Self {
        Self {
            cpu_limit: 10_000_000_000,
            clock_limit: None,
            memory_limit: 256 * 1024 * 1024,
            proc_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSettings {
    pub init_step: RunningSettings,
    pub run_step: RunningSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Fed to stdin.
    pub input: String,
    /// Expected stdout.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunnerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub run_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_command: Option<String>,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub output_comparison: OutputComparison,
    #[serde(default)]
    pub advanced_settings: AdvancedSettings,
}

impl TestRunnerConfig {
    /// Init command, if it is set and not blank.
    pub fn init_command(&self) -> Option<&str> {
        self.init_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

impl PluginConfig for TestRunnerConfig {
    const TYPE: &'static str = "test-runner";

    fn kind(&self) -> &str {
        &self.kind
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn check(&self) -> Result<(), String> {
        if self.run_command.trim().is_empty() {
            return Err("runCommand must not be empty".to_string());
        }
        if self.test_cases.is_empty() {
            return Err("at least one test case is required".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// static-analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresetLanguage {
    CCpp,
    CSharp,
    Go,
    Java,
    Javascript,
    Typescript,
    Python,
    Auto,
}

impl PresetLanguage {
    /// Registry rulesets for the preset.
    pub fn rulesets(self) -> &'static [&'static str] {
        match self {
            Self::CCpp => &["p/c"],
            Self::CSharp => &["p/csharp"],
            Self::Go => &["p/go", "p/gosec"],
            Self::Java => &["p/java"],
            Self::Javascript => &["p/javascript"],
            Self::Typescript => &["p/typescript"],
            Self::Python => &["p/python"],
            Self::Auto => &["auto"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(rename = "type")]
    pub language: PresetLanguage,
}

/// Points deducted per finding of each severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeductionMap {
    pub critical: f64,
    pub error: f64,
    pub warning: f64,
    pub info: f64,
}

impl Default for DeductionMap {
    fn default() -> Self {
        Self {
            critical: 20.0,
            error: 15.0,
            warning: 2.0,
            info: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticAnalysisConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub cross_file_analysis: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub additional_rulesets: Vec<String>,
    #[serde(default)]
    pub deduction_map: DeductionMap,
}

impl StaticAnalysisConfig {
    /// Preset rulesets followed by the additional ones.
    pub fn rulesets(&self) -> Vec<String> {
        self.preset
            .iter()
            .flat_map(|p| p.language.rulesets().iter().map(|r| r.to_string()))
            .chain(self.additional_rulesets.iter().cloned())
            .collect()
    }
}

impl PluginConfig for StaticAnalysisConfig {
    const TYPE: &'static str = "static-analysis";

    fn kind(&self) -> &str {
        &self.kind
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn check(&self) -> Result<(), String> {
        if self.preset.is_none() && self.additional_rulesets.is_empty() {
            return Err("Either 'preset' or 'additionalRulesets' must be set".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// type-coverage
// ---------------------------------------------------------------------------

fn default_deduction_multiplier() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCoverageConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Points deducted per percent of missing type coverage.
    #[serde(default = "default_deduction_multiplier")]
    pub deduction_multiplier: u32,
}

impl PluginConfig for TypeCoverageConfig {
    const TYPE: &'static str = "type-coverage";

    fn kind(&self) -> &str {
        &self.kind
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn check(&self) -> Result<(), String> {
        if self.deduction_multiplier < 1 {
            return Err("deductionMultiplier must be at least 1".to_string());
        }
        Ok(())
    }
}
