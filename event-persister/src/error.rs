use persister_common::redis::StoreError;
use thiserror::Error;

/// Errors raised by a message source while pulling.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("message source closed")]
    Closed,
}

/// A message payload that cannot be turned into an event. Never retried.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("envelope has no environment")]
    MissingEnvironment,
}

/// Failure to list the experiments of an environment. Shared by every caller of a
/// coalesced lookup, hence `Clone`.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("experiment service request failed: {0}")]
    Request(String),
    #[error("experiment service returned {0}")]
    Status(u16),
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("user evaluation not found")]
    NotFound,
    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("warehouse request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to decode user evaluation: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to read evaluations: {0}")]
    Io(#[from] std::io::Error),
    #[error("evaluation source unavailable: {0}")]
    Unavailable(String),
}

/// Why an event could not be attributed to an experiment.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no experiment matches the event")]
    ExperimentNotFound,
    #[error("event was issued after the experiment ended")]
    IssuedAfterExperimentEnded,
    #[error("event was issued before the experiment started")]
    IssuedBeforeExperimentStarted,
    #[error("goal was reached before the user was evaluated")]
    GoalBeforeEvaluation,
    #[error("failed to look up the user evaluation: {0}")]
    EvaluationUnavailable(EvaluationError),
    #[error("failed to resolve experiments: {0}")]
    Resolve(#[from] ResolveError),
}

impl LinkError {
    /// Whether redelivering the message may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            LinkError::ExperimentNotFound
            | LinkError::IssuedAfterExperimentEnded
            | LinkError::IssuedBeforeExperimentStarted
            | LinkError::GoalBeforeEvaluation => false,
            LinkError::EvaluationUnavailable(_) | LinkError::Resolve(_) => true,
        }
    }

    /// Stable code used as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::ExperimentNotFound => "experiment_not_found",
            LinkError::IssuedAfterExperimentEnded => "issued_after_experiment_ended",
            LinkError::IssuedBeforeExperimentStarted => "issued_before_experiment_started",
            LinkError::GoalBeforeEvaluation => "goal_before_evaluation",
            LinkError::EvaluationUnavailable(_) => "evaluation_unavailable",
            LinkError::Resolve(_) => "experiment_resolve_failed",
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("warehouse request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to append to row store: {0}")]
    Io(#[from] std::io::Error),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("failed to append rows: {0}")]
    Sink(#[from] SinkError),
}

/// Errors related to initialization and running of the persister.
#[derive(Error, Debug)]
pub enum PersisterError {
    #[error("message source failed: {0}")]
    Source(#[from] SourceError),
    #[error("shared store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("a task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}
