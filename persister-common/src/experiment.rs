use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// How long a stopped experiment keeps accepting late events, in seconds.
///
/// Clients buffer events while offline, so events timestamped inside the experiment window
/// keep arriving for a while after it stopped.
pub const STOPPED_EXPERIMENT_GRACE_SECS: i64 = 2 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Running,
    Stopped,
    #[serde(other)]
    Other,
}

/// A read-only copy of an experiment owned by the experiment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub feature_id: String,
    pub feature_version: i32,
    #[serde(default)]
    pub goal_ids: BTreeSet<String>,
    pub status: ExperimentStatus,
    /// Unix seconds.
    pub start_at: i64,
    /// Unix seconds.
    pub stop_at: i64,
}

impl Experiment {
    pub fn has_goal(&self, goal_id: &str) -> bool {
        self.goal_ids.contains(goal_id)
    }

    /// Whether `timestamp` falls inside `[start_at, stop_at]`.
    pub fn covers(&self, timestamp: i64) -> bool {
        self.start_at <= timestamp && timestamp <= self.stop_at
    }

    /// Whether events processed at `now` may still be attributed to this experiment.
    pub fn accepts_events_at(&self, now: i64) -> bool {
        match self.status {
            ExperimentStatus::Running => true,
            ExperimentStatus::Stopped => self.stop_at >= stop_at_lower_bound(now),
            ExperimentStatus::Other => false,
        }
    }
}

/// Oldest `stop_at` an experiment may have to still be considered at `now`.
pub fn stop_at_lower_bound(now: i64) -> i64 {
    now - STOPPED_EXPERIMENT_GRACE_SECS
}
