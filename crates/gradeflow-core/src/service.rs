//! Grading service: the subscriber for `grading.submission.started`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::domain::{CriterionOutcome, GradeflowError, GradingRequest, ServiceEvent, SubmissionGraded};
use crate::emitter::ResultEmitter;
use crate::transport::{EventTransport, HandlerError, MessageHandler, TransportResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    /// Publish `grading.criterion.failed` for each failure before the
    /// aggregate event.
    pub early_failure_events: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            early_failure_events: true,
        }
    }
}

/// Decode and validate an inbound request payload.
pub fn decode_request(payload: serde_json::Value) -> crate::domain::Result<GradingRequest> {
    let request: GradingRequest = serde_json::from_value(payload)?;
    request.validate().map_err(GradeflowError::from)?;
    Ok(request)
}

pub struct GradingService {
    dispatcher: Dispatcher,
    emitter: Arc<ResultEmitter>,
    settings: ServiceSettings,
}

impl GradingService {
    pub fn new(dispatcher: Dispatcher, emitter: Arc<ResultEmitter>, settings: ServiceSettings) -> Self {
        Self {
            dispatcher,
            emitter,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Subscribe this service to inbound grading requests.
    pub async fn subscribe(self: Arc<Self>, transport: &dyn EventTransport) -> TransportResult<()> {
        transport.subscribe(GradingRequest::NAME, self).await
    }

    /// Grade `request` and publish its events.
    #[instrument(skip_all, fields(assessment_id = %request.assessment_id, criteria = request.criteria.len()))]
    pub async fn grade(&self, request: &GradingRequest) -> TransportResult<SubmissionGraded> {
        let outcomes = self.dispatcher.dispatch(request).await;
        if self.settings.early_failure_events {
            self.report_failures(&request.assessment_id, &outcomes).await;
        }
        self.emitter.emit_graded(&request.assessment_id, &outcomes).await
    }

    async fn report_failures(&self, assessment_id: &str, outcomes: &[CriterionOutcome]) {
        for outcome in outcomes {
            let CriterionOutcome::Failed {
                criterion_name,
                errors,
            } = outcome
            else {
                continue;
            };
            let error = errors.join("; ");
            if let Err(e) = self
                .emitter
                .emit_criterion_failed(assessment_id, criterion_name, &error)
                .await
            {
                warn!(criterion = %criterion_name, error = %e, "failed to publish criterion failure");
            }
        }
    }
}

#[async_trait]
impl MessageHandler for GradingService {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        let request = decode_request(payload).map_err(|e| {
            warn!(error = %e, "rejecting undecodable grading request");
            HandlerError::new(e)
        })?;
        let event = self.grade(&request).await.map_err(HandlerError::new)?;
        info!(
            assessment_id = %event.assessment_id,
            graded = event.score_breakdown.as_ref().map_or(0, Vec::len),
            errors = event.errors.as_ref().map_or(0, Vec::len),
            "grading request handled"
        );
        Ok(())
    }
}
