//! Deferred goal linkage, tracked in the shared store until the user's evaluation lands in
//! the warehouse.
use std::time::Duration;

use async_trait::async_trait;
use persister_common::event::AttributedEvent;

pub mod scanner;
pub mod store;

pub use store::{RetryDescriptor, RetryStore};

const LOCK_TTL_FLOOR: Duration = Duration::from_secs(15);

/// How long a scanner may hold a descriptor: 80% of the retry interval, at least 15 seconds
/// to cover resolving experiments, querying evaluations and writing rows.
pub fn lock_ttl(retry_interval: Duration) -> Duration {
    (retry_interval * 4 / 5).max(LOCK_TTL_FLOOR)
}

/// What became of one retry attempt.
#[derive(Debug, PartialEq)]
pub enum RetryOutcome {
    /// Every row was written.
    Linked,
    /// The event can no longer be linked.
    Dropped,
    /// Some evaluations are still missing. `linked` holds the rows that did link.
    Deferred { linked: Vec<AttributedEvent> },
    /// Linkage succeeded but these rows could not be written.
    WriteFailed { rows: Vec<AttributedEvent> },
    /// A transient upstream failure, try again unchanged.
    Failed,
}

#[async_trait]
pub trait RetryHandler: Send + Sync {
    /// Attempt the linkage of a descriptor. When `failed_events` is set only the write is
    /// attempted again.
    async fn retry(&self, descriptor: &RetryDescriptor) -> RetryOutcome;

    /// Best effort write of the rows an abandoned descriptor managed to link.
    async fn salvage(&self, descriptor: &RetryDescriptor, rows: Vec<AttributedEvent>);
}
