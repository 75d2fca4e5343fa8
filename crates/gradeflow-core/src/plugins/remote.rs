//! Plugins that grade through a remote action call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::config::{parse_config, StaticAnalysisConfig, TypeCoverageConfig};
use super::{PluginError, PluginKind, PluginResult};
use crate::domain::{Criterion, CriterionOutcome, GradingRequest};
use crate::obs;

/// Body of a remote grade action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub assessment_id: String,
    pub criterion_data_list: Vec<Criterion>,
    pub attachments: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Invokes a plugin's grade action wherever it runs.
#[async_trait]
pub trait ActionCaller: Send + Sync {
    async fn call(&self, plugin_id: &str, request: &ActionRequest) -> PluginResult<Vec<CriterionOutcome>>;
}

/// `POST <base>/api/v1/plugins/<id>/grade`, answered by a JSON array of
/// outcomes.
pub struct HttpActionCaller {
    http: reqwest::Client,
    base_url: String,
}

impl HttpActionCaller {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn grade_url(&self, plugin_id: &str) -> String {
        format!("{}/api/v1/plugins/{plugin_id}/grade", self.base_url)
    }
}

#[async_trait]
impl ActionCaller for HttpActionCaller {
    #[instrument(skip(self, request), fields(criteria = request.criterion_data_list.len()))]
    async fn call(&self, plugin_id: &str, request: &ActionRequest) -> PluginResult<Vec<CriterionOutcome>> {
        let response = self
            .http
            .post(self.grade_url(plugin_id))
            .json(request)
            .send()
            .await
            .map_err(|e| PluginError::Invocation(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Vec<CriterionOutcome>>()
            .await
            .map_err(|e| PluginError::Invocation(format!("malformed plugin response: {e}")))
    }
}

pub struct RemotePlugin {
    kind: PluginKind,
    caller: Arc<dyn ActionCaller>,
}

impl RemotePlugin {
    pub fn new(kind: PluginKind, caller: Arc<dyn ActionCaller>) -> Self {
        Self { kind, caller }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    fn check_config(&self, criterion: &Criterion) -> PluginResult<()> {
        match self.kind {
            PluginKind::StaticAnalysis => {
                parse_config::<StaticAnalysisConfig>(&criterion.configuration).map(|_| ())
            }
            PluginKind::TypeCoverage => {
                parse_config::<TypeCoverageConfig>(&criterion.configuration).map(|_| ())
            }
            PluginKind::Ai | PluginKind::TestRunner => Ok(()),
        }
    }

    /// Validate configurations locally, then send the valid criteria in
    /// one action call. A failed call fails only the criteria it carried.
    #[instrument(skip_all, fields(plugin = %self.kind, criteria = criteria.len()))]
    pub async fn grade(
        &self,
        request: &GradingRequest,
        criteria: &[Criterion],
    ) -> PluginResult<Vec<CriterionOutcome>> {
        let mut outcomes = Vec::new();
        let mut valid = Vec::new();
        for criterion in criteria {
            match self.check_config(criterion) {
                Ok(()) => valid.push(criterion.clone()),
                Err(e) => outcomes.push(CriterionOutcome::failed(
                    criterion.criterion_name.as_str(),
                    e.to_string(),
                )),
            }
        }
        if valid.is_empty() {
            debug!("no criteria with a valid configuration");
            return Ok(outcomes);
        }

        let action = ActionRequest {
            assessment_id: request.assessment_id.clone(),
            criterion_data_list: valid,
            attachments: request.attachments.clone(),
            metadata: request.metadata.clone(),
        };
        match self.caller.call(self.kind.id(), &action).await {
            Ok(graded) => outcomes.extend(graded),
            // Only the criteria that were sent share the call's failure.
            Err(e) => {
                obs::emit_plugin_failed(&request.assessment_id, self.kind.id(), &e);
                let message = e.to_string();
                outcomes.extend(
                    action
                        .criterion_data_list
                        .iter()
                        .map(|c| CriterionOutcome::failed(c.criterion_name.as_str(), message.as_str())),
                );
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_url_is_per_plugin() {
        let caller = HttpActionCaller::new("http://plugins:3000/");
        assert_eq!(
            caller.grade_url("static-analysis"),
            "http://plugins:3000/api/v1/plugins/static-analysis/grade"
        );
    }

    #[test]
    fn action_request_is_camel_case() {
        let request = ActionRequest {
            assessment_id: "A1".to_string(),
            criterion_data_list: vec![],
            attachments: vec![],
            metadata: serde_json::Map::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["assessmentId"], "A1");
        assert!(json["criterionDataList"].is_array());
    }
}
