//! Externally visible events and their payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::criterion::GradingRequest;
use super::outcome::{FeedbackItem, ScoreBreakdown};

/// A payload published on a named topic.
pub trait ServiceEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Topic name, e.g. `grading.submission.started`.
    const NAME: &'static str;
}

impl ServiceEvent for GradingRequest {
    const NAME: &'static str = "grading.submission.started";
}

/// Aggregate result of one grading request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionGraded {
    pub assessment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_breakdown: Option<Vec<ScoreBreakdown>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl ServiceEvent for SubmissionGraded {
    const NAME: &'static str = "grading.submission.graded";
}

/// Score portion of a late, single-criterion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub tag: String,
    pub raw_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub feedback_items: Vec<FeedbackItem>,
}

/// A criterion graded after the aggregate event, e.g. by the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionGraded {
    pub assessment_id: String,
    pub criterion_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub score_breakdown: CriterionScore,
}

impl CriterionGraded {
    pub fn from_breakdown(assessment_id: &str, score: ScoreBreakdown) -> Self {
        Self {
            assessment_id: assessment_id.to_string(),
            criterion_name: score.criterion_name,
            metadata: score.metadata,
            score_breakdown: CriterionScore {
                tag: score.tag,
                raw_score: score.raw_score,
                summary: score.summary,
                feedback_items: score.feedback_items,
            },
        }
    }
}

impl ServiceEvent for CriterionGraded {
    const NAME: &'static str = "grading.criterion.graded";
}

/// Fine-grained failure for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionFailed {
    pub assessment_id: String,
    pub criterion_name: String,
    pub error: String,
}

impl ServiceEvent for CriterionFailed {
    const NAME: &'static str = "grading.criterion.failed";
}
