//! Attribution of events to experiments.
use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use persister_common::event::{AttributedEvent, EvaluationEvent, GoalEvent};
use persister_common::experiment::Experiment;
use tracing::debug;

use crate::error::{EvaluationError, LinkError};
use crate::evaluations::{EvaluationQuery, EvaluationSource};
use crate::metrics_consts::{GOAL_BEFORE_EVALUATION_COUNTER, GOAL_OUTSIDE_WINDOW_COUNTER};

/// Attribute an evaluation to the experiment running on its feature version.
pub fn link_evaluation(
    id: &str,
    environment_id: &str,
    event: &EvaluationEvent,
    experiments: &[Experiment],
) -> Result<AttributedEvent, LinkError> {
    let mut matching = experiments.iter().filter(|e| {
        e.feature_id == event.feature_id && e.feature_version == event.feature_version
    });
    let first = matching.next().ok_or(LinkError::ExperimentNotFound)?;

    // Successive experiments may run on one feature version, prefer the one covering the event.
    let experiment = std::iter::once(first)
        .chain(matching)
        .find(|e| e.covers(event.timestamp))
        .unwrap_or(first);

    if event.timestamp > experiment.stop_at {
        return Err(LinkError::IssuedAfterExperimentEnded);
    }
    if event.timestamp < experiment.start_at {
        return Err(LinkError::IssuedBeforeExperimentStarted);
    }

    Ok(AttributedEvent::from_evaluation(id, environment_id, event))
}

/// Result of linking a goal event.
#[derive(Debug, PartialEq)]
pub enum GoalLinkage {
    /// Every matching experiment was handled, one row per experiment the user was evaluated in.
    Linked(Vec<AttributedEvent>),
    /// At least one evaluation is not in the warehouse yet. `linked` holds the rows of the
    /// experiments that did link.
    Deferred { linked: Vec<AttributedEvent> },
}

pub struct Linker {
    evaluations: Arc<dyn EvaluationSource>,
}

impl Linker {
    pub fn new(evaluations: Arc<dyn EvaluationSource>) -> Self {
        Self { evaluations }
    }

    /// Attribute a goal event to every experiment tracking its goal.
    pub async fn link_goal(
        &self,
        id: &str,
        environment_id: &str,
        event: &GoalEvent,
        experiments: &[Experiment],
    ) -> Result<GoalLinkage, LinkError> {
        let mut candidates = Vec::new();
        for experiment in experiments.iter().filter(|e| e.has_goal(&event.goal_id)) {
            if experiment.covers(event.timestamp) {
                candidates.push(experiment);
            } else {
                counter!(GOAL_OUTSIDE_WINDOW_COUNTER).increment(1);
            }
        }
        if candidates.is_empty() {
            return Err(LinkError::ExperimentNotFound);
        }

        let user_id = event.user_id();
        let queries: Vec<EvaluationQuery<'_>> = candidates
            .iter()
            .map(|experiment| EvaluationQuery {
                environment_id,
                user_id,
                feature_id: &experiment.feature_id,
                feature_version: experiment.feature_version,
                window_start: experiment.start_at,
                window_end: experiment.stop_at,
            })
            .collect();
        let evaluations = join_all(
            queries
                .iter()
                .map(|query| self.evaluations.query_user_evaluation(query)),
        )
        .await;

        let mut linked = Vec::with_capacity(candidates.len());
        let mut missing = false;
        for (experiment, evaluation) in candidates.into_iter().zip(evaluations) {
            match evaluation {
                Ok(evaluation) if event.timestamp < evaluation.timestamp => {
                    counter!(GOAL_BEFORE_EVALUATION_COUNTER).increment(1);
                    debug!(
                        event_id = id,
                        experiment_id = %experiment.id,
                        "goal reached before the user was evaluated"
                    );
                }
                Ok(evaluation) => linked.push(AttributedEvent::from_goal(
                    id,
                    environment_id,
                    event,
                    experiment,
                    &evaluation,
                )),
                Err(EvaluationError::NotFound) => missing = true,
                Err(e) => return Err(LinkError::EvaluationUnavailable(e)),
            }
        }

        if missing {
            Ok(GoalLinkage::Deferred { linked })
        } else if linked.is_empty() {
            Err(LinkError::GoalBeforeEvaluation)
        } else {
            Ok(GoalLinkage::Linked(linked))
        }
    }
}
