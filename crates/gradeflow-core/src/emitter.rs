//! Result emitter: turns outcomes into outbound events.

use std::sync::Arc;

use tracing::instrument;

use crate::domain::{
    CriterionFailed, CriterionGraded, CriterionOutcome, ScoreBreakdown, SubmissionGraded,
};
use crate::obs;
use crate::transport::{publish_event, EventTransport, RetryPolicy, TransportResult};

/// Build the aggregate event for a finished dispatch.
///
/// Graded outcomes become `scoreBreakdown`; every failure message becomes
/// `"<message>: <criterionName>"`. Deferred outcomes appear in neither list.
/// Empty lists are omitted.
pub fn submission_graded(assessment_id: &str, outcomes: &[CriterionOutcome]) -> SubmissionGraded {
    let mut scores = Vec::new();
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            CriterionOutcome::Graded(score) => scores.push(score.clone()),
            CriterionOutcome::Failed {
                criterion_name,
                errors: messages,
            } => errors.extend(messages.iter().map(|m| format!("{m}: {criterion_name}"))),
            CriterionOutcome::Deferred { .. } => {}
        }
    }
    SubmissionGraded {
        assessment_id: assessment_id.to_string(),
        score_breakdown: (!scores.is_empty()).then_some(scores),
        errors: (!errors.is_empty()).then_some(errors),
    }
}

pub struct ResultEmitter {
    transport: Arc<dyn EventTransport>,
    retry: RetryPolicy,
}

impl ResultEmitter {
    pub fn new(transport: Arc<dyn EventTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Publish `grading.submission.graded`, even when nothing was graded.
    #[instrument(skip(self, outcomes), fields(outcomes = outcomes.len()))]
    pub async fn emit_graded(
        &self,
        assessment_id: &str,
        outcomes: &[CriterionOutcome],
    ) -> TransportResult<SubmissionGraded> {
        let event = submission_graded(assessment_id, outcomes);
        publish_event(self.transport.as_ref(), &event, &self.retry).await?;
        obs::emit_outcome_emitted(
            assessment_id,
            event.score_breakdown.as_ref().map_or(0, Vec::len),
            event.errors.as_ref().map_or(0, Vec::len),
        );
        Ok(event)
    }

    pub async fn emit_criterion_failed(
        &self,
        assessment_id: &str,
        criterion_name: &str,
        error: &str,
    ) -> TransportResult<()> {
        let event = CriterionFailed {
            assessment_id: assessment_id.to_string(),
            criterion_name: criterion_name.to_string(),
            error: error.to_string(),
        };
        publish_event(self.transport.as_ref(), &event, &self.retry).await
    }

    pub async fn emit_criterion_graded(
        &self,
        assessment_id: &str,
        score: ScoreBreakdown,
    ) -> TransportResult<()> {
        let event = CriterionGraded::from_breakdown(assessment_id, score);
        publish_event(self.transport.as_ref(), &event, &self.retry).await
    }
}
