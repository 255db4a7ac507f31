//! The batch pipeline: extract, resolve, link, write, then settle every message.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use persister_common::event::{AttributedEvent, Event, EventKind};
use tracing::{error, info, warn};

use crate::error::LinkError;
use crate::experiments::ExperimentResolver;
use crate::extractor::extract;
use crate::linker::{link_evaluation, GoalLinkage, Linker};
use crate::metrics_consts::report_event_outcome;
use crate::retry::{RetryDescriptor, RetryHandler, RetryOutcome, RetryStore};
use crate::windower::{Batch, BatchProcessor};
use crate::writer::Writer;

/// What to tell the bus about one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack(&'static str),
    Nack(&'static str),
    /// Rows are waiting to be written.
    Write,
}

/// Settlements and rows produced by one environment of a batch.
#[derive(Default)]
struct Linked {
    settlements: Vec<(String, EventKind, Settle)>,
    evaluation_rows: Vec<AttributedEvent>,
    goal_rows: Vec<AttributedEvent>,
}

pub struct Persister {
    resolver: Arc<ExperimentResolver>,
    linker: Linker,
    evaluation_writer: Writer,
    goal_writer: Writer,
    retries: Arc<RetryStore>,
}

impl Persister {
    pub fn new(
        resolver: Arc<ExperimentResolver>,
        linker: Linker,
        evaluation_writer: Writer,
        goal_writer: Writer,
        retries: Arc<RetryStore>,
    ) -> Self {
        Self {
            resolver,
            linker,
            evaluation_writer,
            goal_writer,
            retries,
        }
    }

    pub async fn close(&self) {
        self.evaluation_writer.close().await;
        self.goal_writer.close().await;
    }

    async fn link_environment(
        &self,
        environment_id: String,
        events: HashMap<String, Event>,
    ) -> Linked {
        let mut linked = Linked::default();

        let experiments = match self.resolver.resolve(&environment_id).await {
            Ok(experiments) => experiments,
            Err(e) => {
                // Every event of the environment shares the failed lookup.
                let code = LinkError::Resolve(e).code();
                for (id, event) in events {
                    linked.settlements.push((id, event.kind(), Settle::Nack(code)));
                }
                return linked;
            }
        };

        let mut goals = Vec::new();
        for (id, event) in events {
            match event {
                Event::Evaluation(evaluation) => {
                    let settle =
                        match link_evaluation(&id, &environment_id, &evaluation, &experiments) {
                            Ok(row) => {
                                linked.evaluation_rows.push(row);
                                Settle::Write
                            }
                            Err(e) => settle_link_error(&e),
                        };
                    linked
                        .settlements
                        .push((id, EventKind::Evaluation, settle));
                }
                Event::Goal(goal) => goals.push((id, goal)),
            }
        }

        let environment_id = environment_id.as_str();
        let experiments = &experiments;
        let goal_links = goals.iter().map(|(id, goal)| async move {
            let settle = match self
                .linker
                .link_goal(id, environment_id, goal, experiments)
                .await
            {
                Ok(GoalLinkage::Linked(rows)) => return (id.clone(), Settle::Write, rows),
                Ok(GoalLinkage::Deferred { .. }) => {
                    match self.retries.create(environment_id, id, goal).await {
                        Ok(_) => Settle::Ack("deferred"),
                        Err(e) => {
                            warn!(event_id = %id, "failed to defer goal event: {}", e);
                            Settle::Nack("retry_store_unavailable")
                        }
                    }
                }
                Err(e) => settle_link_error(&e),
            };
            (id.clone(), settle, Vec::new())
        });

        for (id, settle, rows) in join_all(goal_links).await {
            linked.goal_rows.extend(rows);
            linked.settlements.push((id, EventKind::Goal, settle));
        }

        linked
    }

    async fn write_retry_rows(&self, rows: Vec<AttributedEvent>) -> RetryOutcome {
        match self.goal_writer.append_rows(&rows).await {
            Ok(failures) if failures.values().any(|retriable| *retriable) => {
                RetryOutcome::WriteFailed { rows }
            }
            Ok(failures) if !failures.is_empty() => RetryOutcome::Dropped,
            Ok(_) => RetryOutcome::Linked,
            Err(e) => {
                warn!("failed to write retried rows: {}", e);
                RetryOutcome::WriteFailed { rows }
            }
        }
    }

    /// Write `rows`, turning the settlement of every written event into an ack.
    async fn write(
        &self,
        writer: &Writer,
        rows: &[AttributedEvent],
        settlements: &mut HashMap<String, (EventKind, Settle)>,
    ) {
        if rows.is_empty() {
            return;
        }

        let failures = match writer.append_rows(rows).await {
            Ok(failures) => failures,
            Err(e) => {
                error!("failed to write rows: {}", e);
                rows.iter()
                    .map(|row| (row.id.clone(), true))
                    .collect::<HashMap<_, _>>()
            }
        };

        for row in rows {
            let Some((_, settle)) = settlements.get_mut(&row.id) else {
                continue;
            };
            if *settle != Settle::Write {
                continue;
            }
            *settle = match failures.get(&row.id) {
                Some(true) => Settle::Nack("write_failed"),
                Some(false) => Settle::Ack("write_rejected"),
                None => Settle::Ack("linked"),
            };
        }
    }
}

fn settle_link_error(e: &LinkError) -> Settle {
    if e.is_retriable() {
        warn!("retriable linkage failure: {}", e);
        Settle::Nack(e.code())
    } else {
        Settle::Ack(e.code())
    }
}

#[async_trait]
impl BatchProcessor for Persister {
    async fn process(&self, batch: Batch) {
        let extracted = extract(batch);
        if extracted.is_empty() {
            return;
        }
        let mut messages = extracted.messages;

        let environments = extracted
            .events
            .into_iter()
            .map(|(environment_id, events)| self.link_environment(environment_id, events));

        let mut settlements = HashMap::new();
        let mut evaluation_rows = Vec::new();
        let mut goal_rows = Vec::new();
        for linked in join_all(environments).await {
            for (id, kind, settle) in linked.settlements {
                settlements.insert(id, (kind, settle));
            }
            evaluation_rows.extend(linked.evaluation_rows);
            goal_rows.extend(linked.goal_rows);
        }

        self.write(&self.evaluation_writer, &evaluation_rows, &mut settlements)
            .await;
        self.write(&self.goal_writer, &goal_rows, &mut settlements)
            .await;

        for (id, (kind, settle)) in settlements {
            let Some(message) = messages.remove(&id) else {
                continue;
            };
            match settle {
                Settle::Ack(code) => {
                    report_event_outcome(kind.as_str(), code);
                    message.ack();
                }
                Settle::Nack(code) => {
                    report_event_outcome(kind.as_str(), code);
                    message.nack();
                }
                Settle::Write => {
                    // Unreachable once both writers ran, redeliver rather than lose it.
                    report_event_outcome(kind.as_str(), "unwritten");
                    message.nack();
                }
            }
        }

        for (id, message) in messages {
            warn!(event_id = %id, "message left unsettled by the pipeline");
            message.nack();
        }
    }
}

#[async_trait]
impl RetryHandler for Persister {
    async fn retry(&self, descriptor: &RetryDescriptor) -> RetryOutcome {
        if !descriptor.failed_events.is_empty() {
            return self
                .write_retry_rows(descriptor.failed_events.clone())
                .await;
        }

        let experiments = match self.resolver.resolve(&descriptor.environment_id).await {
            Ok(experiments) => experiments,
            Err(_) => return RetryOutcome::Failed,
        };

        let linkage = self
            .linker
            .link_goal(
                &descriptor.id,
                &descriptor.environment_id,
                &descriptor.goal_event,
                &experiments,
            )
            .await;

        match linkage {
            Ok(GoalLinkage::Linked(rows)) => {
                let outcome = self.write_retry_rows(rows).await;
                if outcome == RetryOutcome::Linked {
                    report_event_outcome(EventKind::Goal.as_str(), "linked");
                }
                outcome
            }
            Ok(GoalLinkage::Deferred { linked }) => RetryOutcome::Deferred { linked },
            Err(e) if e.is_retriable() => {
                warn!(event_id = %descriptor.id, "retriable linkage failure on retry: {}", e);
                RetryOutcome::Failed
            }
            Err(e) => {
                report_event_outcome(EventKind::Goal.as_str(), e.code());
                RetryOutcome::Dropped
            }
        }
    }

    async fn salvage(&self, descriptor: &RetryDescriptor, rows: Vec<AttributedEvent>) {
        let count = rows.len();
        match self.goal_writer.append_rows(&rows).await {
            Ok(failures) if failures.is_empty() => info!(
                event_id = %descriptor.id,
                rows = count,
                "wrote partially linked goal event"
            ),
            Ok(_) => warn!(
                event_id = %descriptor.id,
                rows = count,
                "failed to write partially linked goal event"
            ),
            Err(e) => warn!(
                event_id = %descriptor.id,
                "failed to write partially linked goal event: {}",
                e
            ),
        }
    }
}
