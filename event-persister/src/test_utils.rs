//! In-memory collaborators for exercising the pipeline without a bus, a warehouse or the
//! experiment service.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use persister_common::event::{AttributedEvent, EvaluationEvent, Event, GoalEvent, User, UserEvaluation};
use persister_common::experiment::{Experiment, ExperimentStatus};
use rand::{distributions::Alphanumeric, Rng};
use tokio_util::sync::CancellationToken;

use crate::error::{EvaluationError, ResolveError, SinkError, SourceError};
use crate::evaluations::{EvaluationQuery, EvaluationSource};
use crate::experiments::{ExperimentSource, ListExperimentsRequest};
use crate::source::{Acknowledge, Message, MessageHandler, MessageSource, ID_ATTRIBUTE};
use crate::windower::{Batch, BatchProcessor};
use crate::writer::Sink;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
}

/// Records how every message it created was settled.
#[derive(Clone, Default)]
pub struct AckLog {
    settlements: Arc<Mutex<Vec<(String, Settlement)>>>,
}

impl AckLog {
    /// Build a message settled into this log. `event_id` becomes the `id` attribute.
    pub fn message(&self, transport_id: &str, event_id: Option<&str>, data: Vec<u8>) -> Message {
        let mut attributes = HashMap::new();
        if let Some(event_id) = event_id {
            attributes.insert(ID_ATTRIBUTE.to_owned(), event_id.to_owned());
        }

        Message::new(
            transport_id.to_owned(),
            data,
            attributes,
            Box::new(LoggingAcknowledger {
                transport_id: transport_id.to_owned(),
                log: self.clone(),
            }),
        )
    }

    pub fn count(&self, settlement: Settlement) -> usize {
        lock(&self.settlements)
            .iter()
            .filter(|(_, s)| *s == settlement)
            .count()
    }

    pub fn settlements_of(&self, transport_id: &str) -> Vec<Settlement> {
        lock(&self.settlements)
            .iter()
            .filter(|(id, _)| id == transport_id)
            .map(|(_, s)| *s)
            .collect()
    }

    fn record(&self, transport_id: String, settlement: Settlement) {
        lock(&self.settlements).push((transport_id, settlement));
    }
}

struct LoggingAcknowledger {
    transport_id: String,
    log: AckLog,
}

impl Acknowledge for LoggingAcknowledger {
    fn ack(self: Box<Self>) {
        self.log.record(self.transport_id, Settlement::Ack);
    }

    fn nack(self: Box<Self>) {
        self.log.record(self.transport_id, Settlement::Nack);
    }
}

/// Delivers a fixed list of messages once, in order.
pub struct VecMessageSource {
    messages: Mutex<Vec<Message>>,
    failing: bool,
}

impl VecMessageSource {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
            failing: false,
        }
    }

    /// Fail with `SourceError::Closed` once every message was delivered.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

#[async_trait]
impl MessageSource for VecMessageSource {
    async fn pull(
        &self,
        shutdown: CancellationToken,
        handler: &dyn MessageHandler,
    ) -> Result<(), SourceError> {
        let messages = std::mem::take(&mut *lock(&self.messages));
        for message in messages {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            handler.handle(message).await;
        }

        if self.failing {
            Err(SourceError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Acks every batch it receives and remembers what was in it.
#[derive(Default)]
pub struct RecordingProcessor {
    batches: Mutex<Vec<Vec<String>>>,
    transport_ids: Mutex<Vec<String>>,
}

impl RecordingProcessor {
    /// Event ids of every processed batch, sorted within a batch.
    pub fn batches(&self) -> Vec<Vec<String>> {
        lock(&self.batches).clone()
    }

    /// Transport ids of every processed message, sorted.
    pub fn transport_ids(&self) -> Vec<String> {
        let mut ids = lock(&self.transport_ids).clone();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BatchProcessor for RecordingProcessor {
    async fn process(&self, batch: Batch) {
        let mut event_ids: Vec<String> = batch.keys().cloned().collect();
        event_ids.sort();
        lock(&self.batches).push(event_ids);

        for (_, message) in batch {
            lock(&self.transport_ids).push(message.id.clone());
            message.ack();
        }
    }
}

/// Serves experiments from memory and counts how often it was asked.
#[derive(Default)]
pub struct StaticExperimentSource {
    experiments: Mutex<HashMap<String, Vec<Experiment>>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl StaticExperimentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, environment_id: &str, experiment: Experiment) {
        lock(&self.experiments)
            .entry(environment_id.to_owned())
            .or_default()
            .push(experiment);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExperimentSource for StaticExperimentSource {
    async fn list_experiments(
        &self,
        request: &ListExperimentsRequest,
    ) -> Result<Vec<Experiment>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResolveError::Status(503));
        }

        Ok(lock(&self.experiments)
            .get(&request.environment_id)
            .map(|experiments| {
                experiments
                    .iter()
                    .filter(|e| request.statuses.contains(&e.status))
                    .filter(|e| {
                        e.status != ExperimentStatus::Stopped
                            || e.stop_at >= request.stop_at_lower_bound
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Answers evaluation queries from memory, like the warehouse would.
#[derive(Default)]
pub struct MemoryEvaluationSource {
    evaluations: Mutex<Vec<(String, String, UserEvaluation)>>,
    failing: AtomicBool,
}

impl MemoryEvaluationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, environment_id: &str, user_id: &str, evaluation: UserEvaluation) {
        lock(&self.evaluations).push((
            environment_id.to_owned(),
            user_id.to_owned(),
            evaluation,
        ));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EvaluationSource for MemoryEvaluationSource {
    async fn query_user_evaluation(
        &self,
        query: &EvaluationQuery<'_>,
    ) -> Result<UserEvaluation, EvaluationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EvaluationError::Unavailable("memory source is failing".to_owned()));
        }

        lock(&self.evaluations)
            .iter()
            .filter(|(environment_id, user_id, evaluation)| {
                environment_id == query.environment_id
                    && user_id == query.user_id
                    && evaluation.feature_id == query.feature_id
                    && evaluation.feature_version == query.feature_version
                    && query.window_start <= evaluation.timestamp
                    && evaluation.timestamp <= query.window_end
            })
            .map(|(_, _, evaluation)| evaluation.clone())
            .min_by_key(|evaluation| evaluation.timestamp)
            .ok_or(EvaluationError::NotFound)
    }
}

/// Collects appended rows, failing the chunks it is told to.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<AttributedEvent>>,
    chunk_sizes: Mutex<Vec<usize>>,
    failing_chunks: Mutex<HashSet<usize>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_chunks(&self, indices: impl IntoIterator<Item = usize>) {
        *lock(&self.failing_chunks) = indices.into_iter().collect();
    }

    /// Fail whole calls, as an unreachable backend would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<AttributedEvent> {
        lock(&self.rows).clone()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        lock(&self.chunk_sizes).clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn append_rows(&self, chunks: Vec<Vec<Vec<u8>>>) -> Result<Vec<usize>, SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("memory sink is failing".to_owned()));
        }

        let failing_chunks = lock(&self.failing_chunks).clone();
        let mut failed = Vec::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if failing_chunks.contains(&index) {
                failed.push(index);
                continue;
            }
            lock(&self.chunk_sizes).push(chunk.len());
            let mut rows = lock(&self.rows);
            for row in chunk {
                let row = serde_json::from_slice(&row).expect("sink received an invalid row");
                rows.push(row);
            }
        }
        Ok(failed)
    }

    async fn close(&self) {}
}

pub fn experiment(
    id: &str,
    feature_id: &str,
    feature_version: i32,
    goal_ids: &[&str],
    start_at: i64,
    stop_at: i64,
) -> Experiment {
    Experiment {
        id: id.to_owned(),
        feature_id: feature_id.to_owned(),
        feature_version,
        goal_ids: goal_ids.iter().map(|g| (*g).to_owned()).collect::<BTreeSet<_>>(),
        status: ExperimentStatus::Running,
        start_at,
        stop_at,
    }
}

pub fn user_evaluation(
    feature_id: &str,
    feature_version: i32,
    variation_id: &str,
    timestamp: i64,
) -> UserEvaluation {
    UserEvaluation {
        feature_id: feature_id.to_owned(),
        feature_version,
        variation_id: variation_id.to_owned(),
        reason: "RULE".to_owned(),
        timestamp,
    }
}

pub fn evaluation_event(
    feature_id: &str,
    feature_version: i32,
    user_id: &str,
    variation_id: &str,
    timestamp: i64,
) -> EvaluationEvent {
    EvaluationEvent {
        feature_id: feature_id.to_owned(),
        feature_version,
        user_id: String::new(),
        user: Some(User {
            id: user_id.to_owned(),
            data: Default::default(),
        }),
        variation_id: variation_id.to_owned(),
        reason: "RULE".to_owned(),
        tag: "web".to_owned(),
        source_id: "JAVASCRIPT".to_owned(),
        timestamp,
    }
}

pub fn goal_event(goal_id: &str, user_id: &str, timestamp: i64) -> GoalEvent {
    GoalEvent {
        goal_id: goal_id.to_owned(),
        user_id: String::new(),
        user: Some(User {
            id: user_id.to_owned(),
            data: Default::default(),
        }),
        value: 1.0,
        tag: "web".to_owned(),
        source_id: "JAVASCRIPT".to_owned(),
        timestamp,
    }
}

fn envelope(environment_id: &str, event: Event) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "environment_id": environment_id,
        "event": event,
    }))
    .expect("failed to encode envelope")
}

pub fn evaluation_envelope(environment_id: &str, event: &EvaluationEvent) -> Vec<u8> {
    envelope(environment_id, Event::Evaluation(event.clone()))
}

pub fn goal_envelope(environment_id: &str, event: &GoalEvent) -> Vec<u8> {
    envelope(environment_id, Event::Goal(event.clone()))
}
