//! A small shared-store wrapper over redis, with an in-memory mock for tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// Scans and scripts run on the same connection as point reads, keep some headroom.
const REDIS_TIMEOUT_MILLISECS: u64 = 500;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("redis command failed: {0}")]
    Redis(Arc<redis::RedisError>),
    #[error("redis command timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Redis(Arc::new(err))
        }
    }
}

/// The subset of commands the retry store and the distributed lock need.
#[async_trait]
pub trait Client: Send + Sync {
    async fn get(&self, k: String) -> Result<Option<String>, StoreError>;
    async fn set_px(&self, k: String, v: String, ttl: Duration) -> Result<(), StoreError>;
    /// Set `k` only if it does not exist yet. Returns whether the value was written.
    async fn set_nx_px(&self, k: String, v: String, ttl: Duration) -> Result<bool, StoreError>;
    async fn del(&self, k: String) -> Result<(), StoreError>;
    /// Delete `k` only if it currently holds `v`. Returns whether a key was deleted.
    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, StoreError>;
    /// One page of a cursor based scan. A returned cursor of 0 means the scan is complete.
    async fn scan(
        &self,
        cursor: u64,
        pattern: String,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;
}

pub struct RedisClient {
    connection: MultiplexedConnection,
    unlock_script: redis::Script,
}

impl RedisClient {
    pub async fn new(addr: String) -> Result<RedisClient, StoreError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_tokio_connection().await?;

        Ok(RedisClient {
            connection,
            unlock_script: redis::Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }
}

async fn with_timeout<T, F>(fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, redis::RedisError>>,
{
    match timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        with_timeout(conn.get::<_, Option<String>>(k)).await
    }

    async fn set_px(&self, k: String, v: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(k).arg(v).arg("PX").arg(ttl_millis(ttl));

        with_timeout(cmd.query_async::<_, ()>(&mut conn)).await
    }

    async fn set_nx_px(&self, k: String, v: String, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(k).arg(v).arg("NX").arg("PX").arg(ttl_millis(ttl));

        let reply: Option<String> = with_timeout(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, k: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        with_timeout(conn.del::<_, ()>(k)).await
    }

    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.unlock_script.key(k);
        invocation.arg(v);

        let deleted: i64 = with_timeout(invocation.invoke_async(&mut conn)).await?;
        Ok(deleted == 1)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: String,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);

        with_timeout(cmd.query_async::<_, (u64, Vec<String>)>(&mut conn)).await
    }
}

#[derive(Clone)]
struct MockEntry {
    value: String,
    expires_at: Option<Instant>,
    /// Insertion order, kept on overwrite. Scan cursors point into it so that deleting keys
    /// mid-scan does not skip others.
    seq: u64,
}

impl MockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory `Client` honoring expiry, with a switch to simulate an unavailable store.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, MockEntry>>>,
    failing: Arc<AtomicBool>,
    next_seq: Arc<AtomicU64>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        MockRedisClient::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Live keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("mock store is failing".to_owned()))
        } else {
            Ok(())
        }
    }

    fn seq_for(&self, entries: &HashMap<String, MockEntry>, k: &str, now: Instant) -> u64 {
        match entries.get(k) {
            Some(entry) if entry.is_live(now) => entry.seq,
            _ => self.next_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries()
            .get(&k)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_px(&self, k: String, v: String, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = MockEntry {
            value: v,
            expires_at: Some(now + ttl),
            seq: self.seq_for(&entries, &k, now),
        };
        entries.insert(k, entry);
        Ok(())
    }

    async fn set_nx_px(&self, k: String, v: String, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries();
        if entries.get(&k).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        let seq = self.seq_for(&entries, &k, now);
        entries.insert(
            k,
            MockEntry {
                value: v,
                expires_at: Some(now + ttl),
                seq,
            },
        );
        Ok(true)
    }

    async fn del(&self, k: String) -> Result<(), StoreError> {
        self.check()?;
        self.entries().remove(&k);
        Ok(())
    }

    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(&k) {
            Some(entry) if entry.is_live(now) && entry.value == v => {
                entries.remove(&k);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: String,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut matching: Vec<(u64, String)> = self
            .entries()
            .iter()
            .filter(|(k, entry)| entry.is_live(now) && entry.seq >= cursor && glob_match(&pattern, k))
            .map(|(k, entry)| (entry.seq, k.clone()))
            .collect();
        matching.sort();

        let count = count.max(1);
        let next = match matching.get(count) {
            Some((seq, _)) => *seq,
            None => 0,
        };
        let page = matching.into_iter().take(count).map(|(_, k)| k).collect();

        Ok((next, page))
    }
}

/// Redis style glob matching, supporting only `*`.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    key.ends_with(last)
}
