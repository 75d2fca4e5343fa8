//! In-process AI grader.
//!
//! Criteria are bundled by file set, each bundle is graded in one model
//! call together with the rubric rows of every criterion sharing it, and
//! the model's grades are mapped back onto the criteria.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{PluginError, PluginKind, PluginResult};
use crate::bundler::{BundleInput, Bundler, FileBundle};
use crate::domain::{Criterion, CriterionOutcome, FeedbackItem, GradingRequest, Level, ScoreBreakdown};

/// Failure text for a criterion the model did not grade.
pub const MISSING_GRADE_MESSAGE: &str = "No grading result returned";

/// One rubric row as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricRow {
    pub criterion_name: String,
    pub levels: Vec<Level>,
}

/// Everything the model sees for one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub assessment_id: String,
    pub bundle_id: String,
    pub content: String,
    pub criteria: Vec<RubricRow>,
}

/// The model's verdict for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelGrade {
    pub criterion_name: String,
    pub tag: String,
    /// Falls back to the weight of the level named by `tag`.
    #[serde(default)]
    pub raw_score: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub feedback_items: Vec<FeedbackItem>,
}

/// Language model collaborator.
#[async_trait]
pub trait GradingModel: Send + Sync {
    async fn grade(&self, request: &ModelRequest) -> PluginResult<Vec<ModelGrade>>;
}

/// `POST <url>` with a [`ModelRequest`] body, answered by a JSON array of
/// [`ModelGrade`]s.
pub struct HttpGradingModel {
    http: reqwest::Client,
    url: String,
}

impl HttpGradingModel {
    pub fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl GradingModel for HttpGradingModel {
    #[instrument(skip(self, request), fields(bundle_id = %request.bundle_id, criteria = request.criteria.len()))]
    async fn grade(&self, request: &ModelRequest) -> PluginResult<Vec<ModelGrade>> {
        let response = self
            .http
            .post(&self.url)
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
            .json::<Vec<ModelGrade>>()
            .await
            .map_err(|e| PluginError::Invocation(format!("malformed model response: {e}")))
    }
}

pub struct AiGrader {
    bundler: Arc<Bundler>,
    model: Arc<dyn GradingModel>,
}

impl AiGrader {
    pub fn new(bundler: Arc<Bundler>, model: Arc<dyn GradingModel>) -> Self {
        Self { bundler, model }
    }

    /// Grade `criteria`. A failed download fails the whole call; anything
    /// narrower fails only the criteria it touches.
    ///
    /// The download cache entry lives for this call only. Its key carries a
    /// per-call suffix so two calls for the same assessment never release
    /// each other's directory. Files shared between criteria are still
    /// fetched once, since every bundle of the call goes through one entry.
    #[instrument(skip_all, fields(assessment_id = %request.assessment_id, criteria = criteria.len()))]
    pub async fn grade(
        &self,
        request: &GradingRequest,
        criteria: &[Criterion],
    ) -> PluginResult<Vec<CriterionOutcome>> {
        let cache_key = format!("{}/{}", request.assessment_id, uuid::Uuid::new_v4());
        let result = self.grade_with_cache(&cache_key, request, criteria).await;
        if let Err(e) = self.bundler.release(&cache_key).await {
            warn!(cache_key = %cache_key, error = %e, "failed to release download cache");
        }
        result
    }

    async fn grade_with_cache(
        &self,
        cache_key: &str,
        request: &GradingRequest,
        criteria: &[Criterion],
    ) -> PluginResult<Vec<CriterionOutcome>> {
        let inputs: Vec<BundleInput> = criteria
            .iter()
            .map(|c| BundleInput {
                criterion_name: c.criterion_name.clone(),
                file_refs: c.file_refs.clone(),
            })
            .collect();
        let report = self.bundler.bundle(cache_key, &inputs).await?;

        let mut outcomes: Vec<CriterionOutcome> = report
            .errors
            .iter()
            .flat_map(|failure| {
                failure
                    .criterion_names
                    .iter()
                    .map(|name| CriterionOutcome::failed(name.as_str(), failure.error.as_str()))
            })
            .collect();

        let by_name: HashMap<&str, &Criterion> = criteria
            .iter()
            .map(|c| (c.criterion_name.as_str(), c))
            .collect();
        let graded = join_all(
            report
                .bundles
                .iter()
                .map(|bundle| self.grade_bundle(&request.assessment_id, bundle, &by_name)),
        )
        .await;
        outcomes.extend(graded.into_iter().flatten());
        Ok(outcomes)
    }

    async fn grade_bundle(
        &self,
        assessment_id: &str,
        bundle: &FileBundle,
        by_name: &HashMap<&str, &Criterion>,
    ) -> Vec<CriterionOutcome> {
        let request = ModelRequest {
            assessment_id: assessment_id.to_string(),
            bundle_id: bundle.bundle_id.clone(),
            content: bundle.packed_content.clone(),
            criteria: bundle
                .criterion_names
                .iter()
                .filter_map(|name| by_name.get(name.as_str()))
                .map(|c| RubricRow {
                    criterion_name: c.criterion_name.clone(),
                    levels: c.levels.clone(),
                })
                .collect(),
        };

        let grades = match self.model.grade(&request).await {
            Ok(grades) => grades,
            Err(e) => {
                warn!(bundle_id = %bundle.bundle_id, error = %e, "model call failed");
                let message = e.to_string();
                return bundle
                    .criterion_names
                    .iter()
                    .map(|name| CriterionOutcome::failed(name.as_str(), message.as_str()))
                    .collect();
            }
        };
        debug!(bundle_id = %bundle.bundle_id, grades = grades.len(), "model graded bundle");

        let mut grades: HashMap<String, ModelGrade> = grades
            .into_iter()
            .map(|g| (g.criterion_name.clone(), g))
            .collect();
        bundle
            .criterion_names
            .iter()
            .map(|name| match grades.remove(name) {
                Some(grade) => {
                    let levels = by_name
                        .get(name.as_str())
                        .map(|c| c.levels.as_slice())
                        .unwrap_or_default();
                    CriterionOutcome::Graded(to_breakdown(grade, levels))
                }
                None => CriterionOutcome::failed(name.as_str(), MISSING_GRADE_MESSAGE),
            })
            .collect()
    }
}

fn to_breakdown(grade: ModelGrade, levels: &[Level]) -> ScoreBreakdown {
    let raw_score = grade.raw_score.unwrap_or_else(|| {
        levels
            .iter()
            .find(|level| level.tag == grade.tag)
            .map(|level| f64::from(level.weight))
            .unwrap_or(0.0)
    });
    ScoreBreakdown {
        criterion_name: grade.criterion_name,
        tag: grade.tag,
        raw_score,
        plugin: PluginKind::Ai.id().to_string(),
        summary: grade.summary,
        metadata: None,
        feedback_items: grade.feedback_items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> Vec<Level> {
        vec![
            Level {
                tag: "good".to_string(),
                description: String::new(),
                weight: 100,
            },
            Level {
                tag: "ok".to_string(),
                description: String::new(),
                weight: 50,
            },
        ]
    }

    #[test]
    fn score_falls_back_to_level_weight() {
        let grade = ModelGrade {
            criterion_name: "C1".to_string(),
            tag: "ok".to_string(),
            raw_score: None,
            summary: None,
            feedback_items: vec![],
        };
        let breakdown = to_breakdown(grade, &levels());
        assert_eq!(breakdown.raw_score, 50.0);
        assert_eq!(breakdown.plugin, "ai");
    }

    #[test]
    fn explicit_score_wins_and_unknown_tag_scores_zero() {
        let grade = ModelGrade {
            criterion_name: "C1".to_string(),
            tag: "good".to_string(),
            raw_score: Some(87.5),
            summary: Some("solid".to_string()),
            feedback_items: vec![],
        };
        assert_eq!(to_breakdown(grade, &levels()).raw_score, 87.5);

        let unknown = ModelGrade {
            criterion_name: "C1".to_string(),
            tag: "mystery".to_string(),
            raw_score: None,
            summary: None,
            feedback_items: vec![],
        };
        assert_eq!(to_breakdown(unknown, &levels()).raw_score, 0.0);
    }

    #[test]
    fn model_grade_decodes_camel_case() {
        let grade: ModelGrade = serde_json::from_str(
            r#"{"criterionName":"C1","tag":"good","rawScore":90,"feedbackItems":[{"comment":"nice"}]}"#,
        )
        .unwrap();
        assert_eq!(grade.raw_score, Some(90.0));
        assert_eq!(grade.feedback_items[0].comment, "nice");
    }
}
