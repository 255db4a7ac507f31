use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::redis::{Client, StoreError};

const LOCK_KEY_PREFIX: &str = "lock";

/// An exclusive, expiring lock shared by every process using the same store.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock for `key`. Returns the token needed to release it, or `None`
    /// when another holder currently owns it.
    async fn lock(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Release the lock for `key` if it is still held with `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError>;
}

/// Single instance redis lock: `SET NX PX` with a random token, compare-and-delete to release.
pub struct RedisLock {
    client: Arc<dyn Client>,
    ttl: Duration,
}

impl RedisLock {
    pub fn new(client: Arc<dyn Client>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn lock_key(key: &str) -> String {
        format!("{}:{}", LOCK_KEY_PREFIX, key)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn lock(&self, key: &str) -> Result<Option<String>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .client
            .set_nx_px(Self::lock_key(key), token.clone(), self.ttl)
            .await?;

        Ok(acquired.then_some(token))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.client
            .del_if_eq(Self::lock_key(key), token.to_owned())
            .await
    }
}
