//! Criterion dispatcher.
//!
//! A request is partitioned by plugin id, each plugin group is invoked on
//! its own task, and the per-group results are joined back into exactly one
//! outcome per criterion, in request order. Nothing a plugin does can fail
//! the dispatch as a whole: an unknown id, an invocation error and a
//! panicked task all become failure outcomes for the criteria concerned.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{CriterionOutcome, GradingRequest};
use crate::metrics::METRICS;
use crate::obs::{self, SubmissionSpan};
use crate::plugins::{PluginKind, PluginRegistry};

/// Failure text for a criterion its plugin returned nothing for.
pub const MISSING_OUTCOME_MESSAGE: &str = "Plugin returned no outcome";

/// Criteria of one request assigned to one plugin, as request indices.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginGroup {
    pub kind: PluginKind,
    pub indices: Vec<usize>,
}

/// Result of partitioning a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub groups: Vec<PluginGroup>,
    /// Criteria that failed before any plugin ran.
    pub rejected: Vec<(usize, CriterionOutcome)>,
}

/// Group criteria by plugin in first-seen order. Ids the registry cannot
/// resolve are rejected as unsupported.
pub fn partition(registry: &PluginRegistry, request: &GradingRequest) -> Partition {
    let mut out = Partition::default();
    for (index, criterion) in request.criteria.iter().enumerate() {
        let kind = match registry.resolve(&criterion.plugin) {
            Ok(plugin) => plugin.kind(),
            Err(message) => {
                out.rejected
                    .push((index, CriterionOutcome::failed(criterion.criterion_name.as_str(), message)));
                continue;
            }
        };
        match out.groups.iter_mut().find(|g| g.kind == kind) {
            Some(group) => group.indices.push(index),
            None => out.groups.push(PluginGroup {
                kind,
                indices: vec![index],
            }),
        }
    }
    out
}

pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Grade every criterion of `request`.
    ///
    /// The returned list always has one outcome per criterion, in the order
    /// the criteria were given.
    pub async fn dispatch(&self, request: &GradingRequest) -> Vec<CriterionOutcome> {
        METRICS.inc_submissions_received();
        let plan = {
            let _span = SubmissionSpan::enter(&request.assessment_id);
            obs::emit_submission_received(&request.assessment_id, request.criteria.len());
            let plan = partition(&self.registry, request);
            debug!(groups = plan.groups.len(), rejected = plan.rejected.len(), "request partitioned");
            plan
        };

        let mut slots: Vec<Option<CriterionOutcome>> = vec![None; request.criteria.len()];
        for (index, outcome) in plan.rejected {
            slots[index] = Some(outcome);
        }

        let shared = Arc::new(request.clone());
        let tasks: Vec<(PluginGroup, JoinHandle<Result<Vec<CriterionOutcome>, String>>)> = plan
            .groups
            .into_iter()
            .map(|group| {
                let registry = Arc::clone(&self.registry);
                let request = Arc::clone(&shared);
                let task_group = group.clone();
                let handle = tokio::spawn(async move {
                    let plugin = registry.resolve(task_group.kind.id())?;
                    let criteria: Vec<_> = task_group
                        .indices
                        .iter()
                        .map(|&i| request.criteria[i].clone())
                        .collect();
                    obs::emit_plugin_invoked(&request.assessment_id, task_group.kind.id(), criteria.len());
                    plugin
                        .invoke(&request, &criteria)
                        .await
                        .map_err(|e| e.to_string())
                });
                (group, handle)
            })
            .collect();

        for (group, handle) in tasks {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(format!("plugin task failed: {e}")),
            };
            match result {
                Ok(outcomes) => place(request, &group, outcomes, &mut slots),
                Err(message) => {
                    obs::emit_plugin_failed(&request.assessment_id, group.kind.id(), &message);
                    for &index in &group.indices {
                        slots[index] = Some(CriterionOutcome::failed(
                            request.criteria[index].criterion_name.as_str(),
                            message.as_str(),
                        ));
                    }
                }
            }
        }

        let outcomes: Vec<CriterionOutcome> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    CriterionOutcome::failed(
                        request.criteria[index].criterion_name.as_str(),
                        MISSING_OUTCOME_MESSAGE,
                    )
                })
            })
            .collect();

        let failures = outcomes.iter().filter(|o| o.is_failure()).count();
        METRICS.add_criteria_dispatched(outcomes.len() as u64);
        METRICS.add_criteria_failed(failures as u64);
        obs::emit_submission_dispatched(&request.assessment_id, outcomes.len(), failures);
        outcomes
    }
}

/// Match a group's outcomes to its criteria by name. Outcomes naming no
/// open criterion of the group are discarded.
fn place(
    request: &GradingRequest,
    group: &PluginGroup,
    outcomes: Vec<CriterionOutcome>,
    slots: &mut [Option<CriterionOutcome>],
) {
    for outcome in outcomes {
        let open = group.indices.iter().copied().find(|&i| {
            slots[i].is_none() && request.criteria[i].criterion_name == outcome.criterion_name()
        });
        match open {
            Some(index) => slots[index] = Some(outcome),
            None => warn!(
                plugin = %group.kind,
                criterion = %outcome.criterion_name(),
                "discarding outcome for a criterion not in the group"
            ),
        }
    }
}
