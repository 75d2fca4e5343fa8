//! Rubric criteria and the grading request that carries them.

use serde::{Deserialize, Deserializer, Serialize};

use super::error::ValidationError;

/// One achievable level of a criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub tag: String,
    pub description: String,
    /// Percentage weight, 0..=100. Numeric strings are accepted on input.
    #[serde(deserialize_with = "deserialize_weight")]
    pub weight: u32,
}

fn deserialize_weight<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Weight {
        Number(f64),
        Text(String),
    }

    let raw = match Weight::deserialize(deserializer)? {
        Weight::Number(n) => n,
        Weight::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("weight is not a number: {s}")))?,
    };
    if raw.fract() != 0.0 || !(0.0..=100.0).contains(&raw) {
        return Err(serde::de::Error::custom(format!(
            "weight must be an integer in 0..=100, got {raw}"
        )));
    }
    Ok(raw as u32)
}

/// One rubric row to grade. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub criterion_name: String,
    #[serde(default)]
    pub file_refs: Vec<String>,
    #[serde(default)]
    pub levels: Vec<Level>,
    pub plugin: String,
    /// Plugin configuration document, JSON-encoded.
    #[serde(default)]
    pub configuration: String,
}

impl Criterion {
    /// Level whose weight is the highest one not above `score`, falling back
    /// to the lowest level when the score is below every weight.
    pub fn level_for_score(&self, score: f64) -> Option<&Level> {
        self.levels
            .iter()
            .filter(|level| f64::from(level.weight) <= score)
            .max_by_key(|level| level.weight)
            .or_else(|| self.levels.iter().min_by_key(|level| level.weight))
    }
}

/// Payload of `grading.submission.started`; consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingRequest {
    pub assessment_id: String,
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl GradingRequest {
    /// Reject requests that cannot be graded at all.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.assessment_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "assessmentId".to_string(),
            });
        }
        if let Some(c) = self.criteria.iter().find(|c| c.criterion_name.is_empty()) {
            return Err(ValidationError::MissingField {
                field: format!("criterionName (plugin {})", c.plugin),
            });
        }
        for c in &self.criteria {
            if let Some(level) = c.levels.iter().find(|l| l.weight > 100) {
                return Err(ValidationError::InvalidField {
                    field: format!("{}.levels.{}.weight", c.criterion_name, level.tag),
                    reason: format!("{} is outside 0..=100", level.weight),
                });
            }
        }
        Ok(())
    }
}
