use std::sync::Arc;
use std::time::Duration;

use metrics::{gauge, histogram};
use persister_common::event::AttributedEvent;
use persister_common::health::HealthHandle;
use persister_common::lock::DistributedLock;
use persister_common::redis::StoreError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{Reschedule, RetryDescriptor, RetryStore};
use super::{RetryHandler, RetryOutcome};
use crate::metrics_consts::{report_retry, RETRY_PENDING_GAUGE, RETRY_SCAN_DURATION_HISTOGRAM};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Descriptors found by the scan.
    pub seen: usize,
    /// Descriptors that were due, locked and attempted.
    pub attempted: usize,
}

/// Periodically walks every retry descriptor and attempts the ones that are due.
///
/// Exclusion between scanners is given by the per descriptor lock, any number of processes
/// may scan the same store.
pub struct RetryScanner {
    store: Arc<RetryStore>,
    lock: Arc<dyn DistributedLock>,
    handler: Arc<dyn RetryHandler>,
    interval: Duration,
    page_size: usize,
    liveness: HealthHandle,
}

impl RetryScanner {
    pub fn new(
        store: Arc<RetryStore>,
        lock: Arc<dyn DistributedLock>,
        handler: Arc<dyn RetryHandler>,
        interval: Duration,
        page_size: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            lock,
            handler,
            interval,
            page_size: page_size.max(1),
            liveness,
        }
    }

    /// Scan every `interval` until `shutdown` is cancelled. Unprocessed descriptors stay in
    /// the store.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.liveness.report_healthy();

            match self.scan(&shutdown).await {
                Ok(report) => debug!(
                    seen = report.seen,
                    attempted = report.attempted,
                    "retry scan completed"
                ),
                Err(e) => error!("retry scan failed: {}", e),
            }
        }

        info!("retry scanner stopped");
    }

    pub async fn scan(&self, shutdown: &CancellationToken) -> Result<ScanReport, StoreError> {
        let started = tokio::time::Instant::now();
        let mut report = ScanReport::default();
        let mut cursor = 0;

        loop {
            let (next, keys) = self.store.scan(cursor, self.page_size).await?;
            for key in keys {
                if shutdown.is_cancelled() {
                    return Ok(report);
                }
                report.seen += 1;
                match self.process(&key).await {
                    Ok(true) => report.attempted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key, "failed to process retry: {}", e),
                }
            }
            self.liveness.report_healthy();

            if next == 0 {
                break;
            }
            cursor = next;
        }

        gauge!(RETRY_PENDING_GAUGE).set(report.seen as f64);
        histogram!(RETRY_SCAN_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Attempt the descriptor at `key` if it is due and not locked. Returns whether it was
    /// attempted.
    async fn process(&self, key: &str) -> Result<bool, StoreError> {
        let Some(descriptor) = self.store.get(key).await? else {
            return Ok(false);
        };
        if descriptor.retry_at > self.store.now() {
            return Ok(false);
        }

        let lock_key = descriptor.lock_key();
        let Some(token) = self.lock.lock(&lock_key).await? else {
            report_retry("locked");
            return Ok(false);
        };

        let result = self.attempt(key).await;

        match self.lock.unlock(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "retry lock expired before it was released"),
            Err(e) => warn!(key, "failed to release retry lock: {}", e),
        }
        result
    }

    async fn attempt(&self, key: &str) -> Result<bool, StoreError> {
        // Another scanner may have handled it between our read and the lock.
        let Some(mut descriptor) = self.store.get(key).await? else {
            return Ok(false);
        };
        if descriptor.retry_at > self.store.now() {
            return Ok(false);
        }

        match self.handler.retry(&descriptor).await {
            RetryOutcome::Linked => {
                self.store.delete(&descriptor).await?;
                report_retry("linked");
            }
            RetryOutcome::Dropped => {
                self.store.delete(&descriptor).await?;
                report_retry("dropped");
            }
            RetryOutcome::Deferred { linked } => {
                descriptor.failed_events.clear();
                self.reschedule(descriptor, linked).await?;
            }
            RetryOutcome::WriteFailed { rows } => {
                descriptor.failed_events = rows.clone();
                self.reschedule(descriptor, rows).await?;
            }
            RetryOutcome::Failed => {
                let pending = descriptor.failed_events.clone();
                self.reschedule(descriptor, pending).await?;
            }
        }

        Ok(true)
    }

    async fn reschedule(
        &self,
        descriptor: RetryDescriptor,
        salvage: Vec<AttributedEvent>,
    ) -> Result<(), StoreError> {
        match self.store.reschedule(descriptor.clone()).await? {
            Reschedule::Scheduled { retry_at } => {
                report_retry("rescheduled");
                debug!(
                    event_id = %descriptor.id,
                    environment_id = %descriptor.environment_id,
                    retry_at,
                    "retry rescheduled"
                );
            }
            Reschedule::Exhausted => {
                warn!(
                    event_id = %descriptor.id,
                    environment_id = %descriptor.environment_id,
                    retry_count = descriptor.retry_count,
                    "giving up on goal event linkage"
                );
                if !salvage.is_empty() {
                    self.handler.salvage(&descriptor, salvage).await;
                }
                self.store.delete(&descriptor).await?;
                report_retry("exhausted");
            }
        }

        Ok(())
    }
}
