use std::sync::Arc;
use std::time::Duration;

use persister_common::event::{AttributedEvent, GoalEvent};
use persister_common::redis::{Client, StoreError};
use persister_common::retry::RetryPolicy;
use persister_common::time::TimeSource;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind segment of goal retry keys: `{environment_id}:goal_retry:{id}`.
pub const GOAL_RETRY_KIND: &str = "goal_retry";

pub fn retry_key(environment_id: &str, id: &str) -> String {
    format!("{}:{}:{}", environment_id, GOAL_RETRY_KIND, id)
}

/// Pattern matching every goal retry key, whatever the environment.
pub fn retry_key_pattern() -> String {
    format!("*:{}:*", GOAL_RETRY_KIND)
}

/// A goal event waiting for the evaluations it needs to be linked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDescriptor {
    pub id: String,
    pub environment_id: String,
    pub goal_event: GoalEvent,
    pub retry_count: u32,
    /// Rows that were linked but could not be written. When set only the write is retried.
    #[serde(default)]
    pub failed_events: Vec<AttributedEvent>,
    /// Unix seconds.
    pub first_retry_at: i64,
    /// Unix seconds.
    pub retry_at: i64,
}

impl RetryDescriptor {
    pub fn key(&self) -> String {
        retry_key(&self.environment_id, &self.id)
    }

    /// Key of the lock serializing attempts on this descriptor.
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.environment_id, self.id)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reschedule {
    Scheduled { retry_at: i64 },
    /// The maximum retry period elapsed, the descriptor must be given up.
    Exhausted,
}

/// Persists retry descriptors in the shared store.
///
/// Descriptors outlive their last scheduled attempt by the longer of the retry interval and
/// the scan interval, so a scan always reaches them once more before they expire.
pub struct RetryStore {
    client: Arc<dyn Client>,
    policy: RetryPolicy,
    max_retry_period: Duration,
    expiry_grace: Duration,
    time: Arc<dyn TimeSource>,
}

impl RetryStore {
    pub fn new(
        client: Arc<dyn Client>,
        policy: RetryPolicy,
        max_retry_period: Duration,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            client,
            expiry_grace: policy.initial_interval(),
            policy,
            max_retry_period,
            time,
        }
    }

    /// Keep descriptors around for at least one scan after their last scheduled attempt.
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.expiry_grace = self.expiry_grace.max(scan_interval);
        self
    }

    pub fn now(&self) -> i64 {
        self.time.now()
    }

    /// Create the descriptor of a deferred goal event. An existing descriptor is left alone so
    /// that a redelivery does not restart its schedule. Returns whether one was created.
    pub async fn create(
        &self,
        environment_id: &str,
        id: &str,
        goal_event: &GoalEvent,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let backoff = self.policy.time_until_next_retry(0, Some(self.max_retry_period));
        let descriptor = RetryDescriptor {
            id: id.to_owned(),
            environment_id: environment_id.to_owned(),
            goal_event: goal_event.clone(),
            retry_count: 0,
            failed_events: Vec::new(),
            first_retry_at: now,
            retry_at: now + backoff.as_secs() as i64,
        };

        self.client
            .set_nx_px(
                descriptor.key(),
                encode(&descriptor)?,
                self.max_retry_period + self.expiry_grace,
            )
            .await
    }

    /// Load a descriptor. Undecodable descriptors are deleted and reported as absent.
    pub async fn get(&self, key: &str) -> Result<Option<RetryDescriptor>, StoreError> {
        let Some(raw) = self.client.get(key.to_owned()).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(e) => {
                warn!(key, "deleting undecodable retry descriptor: {}", e);
                self.client.del(key.to_owned()).await?;
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, descriptor: &RetryDescriptor) -> Result<(), StoreError> {
        self.client.del(descriptor.key()).await
    }

    /// Schedule the next attempt of `descriptor` with exponential backoff, capped by the time
    /// left in the maximum retry period.
    pub async fn reschedule(
        &self,
        mut descriptor: RetryDescriptor,
    ) -> Result<Reschedule, StoreError> {
        let now = self.now();
        let elapsed = Duration::from_secs((now - descriptor.first_retry_at).max(0) as u64);
        let Some(remaining) = self
            .max_retry_period
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
        else {
            return Ok(Reschedule::Exhausted);
        };

        descriptor.retry_count += 1;
        let backoff = self
            .policy
            .time_until_next_retry(descriptor.retry_count, Some(remaining));
        descriptor.retry_at = now + backoff.as_secs() as i64;

        self.client
            .set_px(
                descriptor.key(),
                encode(&descriptor)?,
                remaining + self.expiry_grace,
            )
            .await?;

        Ok(Reschedule::Scheduled {
            retry_at: descriptor.retry_at,
        })
    }

    /// One page of retry keys.
    pub async fn scan(&self, cursor: u64, count: usize) -> Result<(u64, Vec<String>), StoreError> {
        self.client.scan(cursor, retry_key_pattern(), count).await
    }
}

fn encode(descriptor: &RetryDescriptor) -> Result<String, StoreError> {
    serde_json::to_string(descriptor).map_err(|e| StoreError::Unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use persister_common::redis::MockRedisClient;
    use persister_common::time::FixedTime;

    use super::*;
    use crate::test_utils::goal_event;

    const NOW: i64 = 1_700_000_000;
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn store(client: &MockRedisClient, time: &FixedTime) -> RetryStore {
        RetryStore::new(
            Arc::new(client.clone()),
            RetryPolicy::new(2, Duration::from_secs(60)),
            DAY,
            Arc::new(time.clone()),
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);
        let store = store(&client, &time);
        let goal = goal_event("g1", "u1", NOW - 10);

        assert!(store.create("env", "m1", &goal).await.unwrap());
        time.advance(30);
        assert!(!store.create("env", "m1", &goal).await.unwrap());

        assert_eq!(client.keys(), vec!["env:goal_retry:m1"]);
        let descriptor = store.get("env:goal_retry:m1").await.unwrap().unwrap();
        assert_eq!(descriptor.first_retry_at, NOW);
        assert_eq!(descriptor.retry_at, NOW + 60);
        assert_eq!(descriptor.retry_count, 0);
        assert_eq!(descriptor.goal_event, goal);
    }

    #[tokio::test]
    async fn test_reschedule_backs_off_exponentially() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);
        let store = store(&client, &time);
        store
            .create("env", "m1", &goal_event("g1", "u1", NOW))
            .await
            .unwrap();

        let mut delays = Vec::new();
        for _ in 0..5 {
            let descriptor = store.get("env:goal_retry:m1").await.unwrap().unwrap();
            time.set(descriptor.retry_at);
            let Reschedule::Scheduled { retry_at } = store.reschedule(descriptor).await.unwrap()
            else {
                panic!("descriptor exhausted too early");
            };
            delays.push(retry_at - time.now());
        }

        assert_eq!(delays, vec![120, 240, 480, 960, 1920]);
        let descriptor = store.get("env:goal_retry:m1").await.unwrap().unwrap();
        assert_eq!(descriptor.retry_count, 5);
    }

    #[tokio::test]
    async fn test_reschedule_is_capped_by_remaining_period() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);
        let store = store(&client, &time);
        store
            .create("env", "m1", &goal_event("g1", "u1", NOW))
            .await
            .unwrap();
        let descriptor = store.get("env:goal_retry:m1").await.unwrap().unwrap();

        time.set(NOW + DAY.as_secs() as i64 - 30);
        assert_eq!(
            store.reschedule(descriptor.clone()).await.unwrap(),
            Reschedule::Scheduled {
                retry_at: NOW + DAY.as_secs() as i64
            }
        );

        time.set(NOW + DAY.as_secs() as i64);
        assert_eq!(
            store.reschedule(descriptor).await.unwrap(),
            Reschedule::Exhausted
        );
    }

    #[tokio::test]
    async fn test_descriptor_outlives_period_by_a_scan_interval() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);
        let store = RetryStore::new(
            Arc::new(client.clone()),
            RetryPolicy::new(2, Duration::from_millis(10)),
            Duration::from_millis(50),
            Arc::new(time.clone()),
        )
        .with_scan_interval(Duration::from_millis(500));
        assert_eq!(store.expiry_grace, Duration::from_millis(500));

        store
            .create("env", "m1", &goal_event("g1", "u1", NOW))
            .await
            .unwrap();

        // Past the retry period plus one retry interval, but not yet past the next scan.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.keys(), vec!["env:goal_retry:m1"]);
    }

    #[test]
    fn test_expiry_grace_keeps_the_longer_interval() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);

        let store = store(&client, &time).with_scan_interval(Duration::from_secs(5));
        assert_eq!(store.expiry_grace, Duration::from_secs(60));

        let store = store.with_scan_interval(Duration::from_secs(300));
        assert_eq!(store.expiry_grace, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_undecodable_descriptor_is_deleted() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);
        let store = store(&client, &time);
        client
            .set_px("env:goal_retry:m1".to_owned(), "{".to_owned(), DAY)
            .await
            .unwrap();

        assert_eq!(store.get("env:goal_retry:m1").await.unwrap(), None);
        assert!(client.keys().is_empty());
    }

    #[tokio::test]
    async fn test_scan_only_returns_retry_keys() {
        let client = MockRedisClient::new();
        let time = FixedTime::new(NOW);
        let store = store(&client, &time);
        for id in ["m1", "m2", "m3"] {
            store
                .create("env", id, &goal_event("g1", "u1", NOW))
                .await
                .unwrap();
        }
        client
            .set_px("lock:env:m1".to_owned(), "token".to_owned(), DAY)
            .await
            .unwrap();

        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = store.scan(cursor, 2).await.unwrap();
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();

        assert_eq!(
            keys,
            vec!["env:goal_retry:m1", "env:goal_retry:m2", "env:goal_retry:m3"]
        );
    }
}
