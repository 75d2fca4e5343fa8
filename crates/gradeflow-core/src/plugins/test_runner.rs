//! Test-runner plugin: starts one sandbox attempt per criterion.
//!
//! The grade arrives later through sandbox callbacks, so a started attempt
//! is reported as [`CriterionOutcome::Deferred`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{instrument, warn};

use super::config::{parse_config, TestRunnerConfig};
use super::{PluginError, PluginResult};
use crate::bundler::blob::{blob_name_parts, create_temp_dir, remove_temp_dir, FileStore};
use crate::domain::{Criterion, CriterionOutcome, GradingRequest};
use crate::sandbox::{SandboxMachine, StartAttempt};

/// Failure text for a criterion without files.
pub const NO_FILES_MESSAGE: &str = "No files to run";

/// Path of a submission file inside the sandbox.
///
/// Blob names look like `<grading>/<submission>/<path...>`; the first two
/// segments are dropped. Shorter names lose only their first segment.
pub fn sandbox_path(blob_name: &str) -> String {
    let segments: Vec<&str> = blob_name.split('/').collect();
    if segments.len() >= 3 {
        return segments[2..].join("/");
    }
    let parts = blob_name_parts(blob_name);
    if parts.rest.is_empty() {
        parts.root
    } else {
        parts.rest
    }
}

pub struct TestRunnerPlugin {
    machine: Arc<SandboxMachine>,
    store: Arc<dyn FileStore>,
    temp_root: PathBuf,
}

impl TestRunnerPlugin {
    pub fn new(machine: Arc<SandboxMachine>, store: Arc<dyn FileStore>, temp_root: PathBuf) -> Self {
        Self {
            machine,
            store,
            temp_root,
        }
    }

    #[instrument(skip_all, fields(assessment_id = %request.assessment_id, criteria = criteria.len()))]
    pub async fn grade(
        &self,
        request: &GradingRequest,
        criteria: &[Criterion],
    ) -> PluginResult<Vec<CriterionOutcome>> {
        let outcomes = join_all(
            criteria
                .iter()
                .map(|criterion| self.start_one(&request.assessment_id, criterion)),
        )
        .await;
        Ok(outcomes)
    }

    async fn start_one(&self, assessment_id: &str, criterion: &Criterion) -> CriterionOutcome {
        let name = criterion.criterion_name.as_str();
        let config: TestRunnerConfig = match parse_config(&criterion.configuration) {
            Ok(config) => config,
            Err(e) => return CriterionOutcome::failed(name, e.to_string()),
        };
        if criterion.file_refs.is_empty() {
            return CriterionOutcome::failed(name, NO_FILES_MESSAGE);
        }
        let files = match self.load_files(&criterion.file_refs).await {
            Ok(files) => files,
            Err(e) => return CriterionOutcome::failed(name, e.to_string()),
        };

        let attempt_id = uuid::Uuid::new_v4().to_string();
        let attempt = StartAttempt {
            attempt_id: attempt_id.clone(),
            assessment_id: assessment_id.to_string(),
            criterion: criterion.clone(),
            config,
            files,
        };
        match self.machine.start(attempt).await {
            Ok(_) => CriterionOutcome::Deferred {
                criterion_name: criterion.criterion_name.clone(),
                attempt_id,
            },
            Err(e) => CriterionOutcome::failed(name, e.to_string()),
        }
    }

    /// Download `file_refs` and read them into memory, keyed by sandbox path.
    async fn load_files(&self, file_refs: &[String]) -> PluginResult<BTreeMap<String, String>> {
        let dir = create_temp_dir(&self.temp_root, "test-runner")
            .await
            .map_err(|e| PluginError::Invocation(e.to_string()))?;
        let loaded = self.read_into(&dir, file_refs).await;
        if let Err(e) = remove_temp_dir(&dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove temporary directory");
        }
        loaded
    }

    async fn read_into(
        &self,
        dir: &std::path::Path,
        file_refs: &[String],
    ) -> PluginResult<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        for file_ref in file_refs {
            let blob = self
                .store
                .blob_name(file_ref)
                .map_err(|e| PluginError::Invocation(e.to_string()))?;
            let local = dir.join(&blob);
            self.store
                .download_to_file(&blob, &local)
                .await
                .map_err(|e| PluginError::Invocation(e.to_string()))?;
            let bytes = tokio::fs::read(&local)
                .await
                .map_err(|e| PluginError::Invocation(e.to_string()))?;
            files.insert(sandbox_path(&blob), String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_path_strips_grading_and_submission() {
        assert_eq!(sandbox_path("g1/s1/src/main.py"), "src/main.py");
        assert_eq!(sandbox_path("g1/s1/main.py"), "main.py");
        assert_eq!(sandbox_path("s1/main.py"), "main.py");
        assert_eq!(sandbox_path("main.py"), "main.py");
    }
}
