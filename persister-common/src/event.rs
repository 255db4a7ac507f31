use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::experiment::Experiment;

/// Tag persisted when a client did not send one.
pub const DEFAULT_TAG: &str = "none";
/// Variation persisted when a client fell back to its default value without evaluating.
pub const DEFAULT_VARIATION_ID: &str = "default";

/// The user an event was emitted for, as embedded by current SDKs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A feature flag evaluation reported by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationEvent {
    pub feature_id: String,
    pub feature_version: i32,
    /// Legacy top-level user id, only read when `user` is absent or empty.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub variation_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub source_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl EvaluationEvent {
    pub fn user_id(&self) -> &str {
        resolve_user_id(self.user.as_ref(), &self.user_id)
    }
}

/// A conversion reported by a client for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalEvent {
    pub goal_id: String,
    /// Legacy top-level user id, only read when `user` is absent or empty.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub value: f32,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub source_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl GoalEvent {
    pub fn user_id(&self) -> &str {
        resolve_user_id(self.user.as_ref(), &self.user_id)
    }
}

fn resolve_user_id<'a>(user: Option<&'a User>, legacy: &'a str) -> &'a str {
    match user {
        Some(user) if !user.id.is_empty() => &user.id,
        _ => legacy,
    }
}

fn user_data(user: Option<&User>) -> String {
    let data = user.map(|u| &u.data);
    match data {
        Some(data) => serde_json::to_string(data).unwrap_or_else(|_| "{}".to_owned()),
        None => "{}".to_owned(),
    }
}

/// The inner event carried by an envelope, tagged on the wire by `@type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "snake_case")]
pub enum Event {
    Evaluation(EvaluationEvent),
    Goal(GoalEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Evaluation(_) => EventKind::Evaluation,
            Event::Goal(_) => EventKind::Goal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Evaluation,
    Goal,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Evaluation => "evaluation",
            EventKind::Goal => "goal",
        }
    }
}

/// The evaluation a user received for a feature, as already stored in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvaluation {
    pub feature_id: String,
    pub feature_version: i32,
    pub variation_id: String,
    pub reason: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// A warehouse row: an event attributed to an experiment.
///
/// `id` is the id of the message the event arrived in, so a goal event linked to several
/// experiments produces several rows sharing the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedEvent {
    pub id: String,
    pub environment_id: String,
    pub feature_id: String,
    pub feature_version: i32,
    pub user_id: String,
    pub user_data: String,
    pub variation_id: String,
    pub reason: String,
    pub tag: String,
    pub source_id: String,
    /// Unix microseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
}

impl AttributedEvent {
    pub fn from_evaluation(id: &str, environment_id: &str, event: &EvaluationEvent) -> Self {
        let variation_id = if event.variation_id.is_empty() {
            DEFAULT_VARIATION_ID
        } else {
            &event.variation_id
        };

        Self {
            id: id.to_owned(),
            environment_id: environment_id.to_owned(),
            feature_id: event.feature_id.clone(),
            feature_version: event.feature_version,
            user_id: event.user_id().to_owned(),
            user_data: user_data(event.user.as_ref()),
            variation_id: variation_id.to_owned(),
            reason: event.reason.clone(),
            tag: tag_or_default(&event.tag),
            source_id: event.source_id.clone(),
            timestamp: seconds_to_micros(event.timestamp),
            goal_id: None,
            value: None,
        }
    }

    pub fn from_goal(
        id: &str,
        environment_id: &str,
        event: &GoalEvent,
        experiment: &Experiment,
        evaluation: &UserEvaluation,
    ) -> Self {
        Self {
            id: id.to_owned(),
            environment_id: environment_id.to_owned(),
            feature_id: experiment.feature_id.clone(),
            feature_version: experiment.feature_version,
            user_id: event.user_id().to_owned(),
            user_data: user_data(event.user.as_ref()),
            variation_id: evaluation.variation_id.clone(),
            reason: evaluation.reason.clone(),
            tag: tag_or_default(&event.tag),
            source_id: event.source_id.clone(),
            timestamp: seconds_to_micros(event.timestamp),
            goal_id: Some(event.goal_id.clone()),
            value: Some(event.value),
        }
    }
}

fn tag_or_default(tag: &str) -> String {
    if tag.is_empty() {
        DEFAULT_TAG.to_owned()
    } else {
        tag.to_owned()
    }
}

fn seconds_to_micros(seconds: i64) -> i64 {
    seconds.saturating_mul(1_000_000)
}
