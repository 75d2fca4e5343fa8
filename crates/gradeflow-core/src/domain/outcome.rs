//! Per-criterion grading outcomes.

use serde::{Deserialize, Serialize};

/// One piece of located feedback attached to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    pub comment: String,
    #[serde(default)]
    pub file_ref: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_col: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_col: Option<u32>,
    #[serde(default)]
    pub from_line: u32,
    #[serde(default)]
    pub to_line: u32,
}

impl FeedbackItem {
    /// Feedback that is not tied to a file location.
    pub fn note(tag: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
            file_ref: String::new(),
            tag: tag.into(),
            from_col: None,
            to_col: None,
            from_line: 0,
            to_line: 0,
        }
    }
}

/// A successful grade for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub criterion_name: String,
    pub tag: String,
    pub raw_score: f64,
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub feedback_items: Vec<FeedbackItem>,
}

/// The result of grading exactly one criterion.
///
/// `Deferred` marks a criterion whose grade is produced later by an
/// asynchronous plugin; it still counts as that criterion's outcome for the
/// current dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CriterionOutcome {
    Graded(ScoreBreakdown),
    #[serde(rename_all = "camelCase")]
    Failed {
        criterion_name: String,
        errors: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Deferred {
        criterion_name: String,
        attempt_id: String,
    },
}

impl CriterionOutcome {
    /// Failure outcome with a single error message.
    pub fn failed(criterion_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Failed {
            criterion_name: criterion_name.into(),
            errors: vec![error.into()],
        }
    }

    pub fn criterion_name(&self) -> &str {
        match self {
            Self::Graded(score) => &score.criterion_name,
            Self::Failed { criterion_name, .. } | Self::Deferred { criterion_name, .. } => {
                criterion_name
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_wire_shape_is_status_tagged() {
        let json = serde_json::to_value(CriterionOutcome::failed("C2", "boom")).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["criterionName"], "C2");
        assert_eq!(json["errors"][0], "boom");
    }

    #[test]
    fn graded_outcome_decodes_from_remote_shape() {
        let json = r#"{
            "status": "graded",
            "criterionName": "C1",
            "tag": "good",
            "rawScore": 80,
            "plugin": "static-analysis",
            "feedbackItems": [{"comment": "unused var", "fileRef": "s1/a.py", "tag": "warning", "fromLine": 3, "toLine": 3}]
        }"#;
        let outcome: CriterionOutcome = serde_json::from_str(json).unwrap();
        assert_eq!(outcome.criterion_name(), "C1");
        match outcome {
            CriterionOutcome::Graded(score) => {
                assert_eq!(score.raw_score, 80.0);
                assert_eq!(score.feedback_items[0].from_line, 3);
                assert!(score.summary.is_none());
            }
            other => panic!("expected graded, got {other:?}"),
        }
    }
}
