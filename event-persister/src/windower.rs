use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use metrics::{counter, histogram};
use persister_common::health::HealthHandle;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics_consts::{
    BATCH_SIZE_HISTOGRAM, DUPLICATE_MESSAGES_COUNTER, FLUSH_DURATION_HISTOGRAM,
    FLUSH_TIMEOUTS_COUNTER, MESSAGES_DROPPED_COUNTER,
};
use crate::source::Message;

/// Messages of one flushed window, keyed by event id.
pub type Batch = HashMap<String, Message>;

/// Consumes flushed windows. Every message of the batch must be settled before returning.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, batch: Batch);
}

/// Buffers messages until `flush_size` distinct events are held or `flush_interval`
/// elapses, then hands the window to a `BatchProcessor` and waits for it.
///
/// Several windowers share one receiver, each keeping its own window.
pub struct BatchWindower {
    name: String,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
    processor: Arc<dyn BatchProcessor>,
    flush_size: usize,
    flush_interval: time::Duration,
    flush_timeout: time::Duration,
    liveness: HealthHandle,
}

impl BatchWindower {
    pub fn new(
        name: &str,
        receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
        processor: Arc<dyn BatchProcessor>,
        flush_size: usize,
        flush_interval: time::Duration,
        flush_timeout: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            receiver,
            processor,
            flush_size: flush_size.max(1),
            flush_interval,
            flush_timeout,
            liveness,
        }
    }

    /// Run until `shutdown` is cancelled or the channel is closed, flushing once more
    /// before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut batch = Batch::with_capacity(self.flush_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain(&mut batch).await;
                    self.flush(&mut batch).await;
                    break;
                }
                _ = ticker.tick() => {
                    self.liveness.report_healthy();
                    self.flush(&mut batch).await;
                }
                received = self.recv() => match received {
                    Some(message) => {
                        add(&mut batch, message);
                        if batch.len() >= self.flush_size {
                            self.flush(&mut batch).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                },
            }
        }

        debug!(windower = %self.name, "windower stopped");
    }

    async fn recv(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }

    /// Take whatever is already queued without waiting for more.
    async fn drain(&self, batch: &mut Batch) {
        let mut receiver = self.receiver.lock().await;
        while let Ok(message) = receiver.try_recv() {
            add(batch, message);
        }
    }

    async fn flush(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }

        let window = std::mem::replace(batch, Batch::with_capacity(self.flush_size));
        let size = window.len();
        histogram!(BATCH_SIZE_HISTOGRAM).record(size as f64);

        let started = tokio::time::Instant::now();
        if tokio::time::timeout(self.flush_timeout, self.processor.process(window))
            .await
            .is_err()
        {
            // Dropping the abandoned batch nacks every message it still held.
            counter!(FLUSH_TIMEOUTS_COUNTER).increment(1);
            warn!(windower = %self.name, size, "batch flush timed out");
        }
        histogram!(FLUSH_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

        self.liveness.report_healthy();
    }
}

fn add(batch: &mut Batch, message: Message) {
    let Some(event_id) = message.event_id().map(str::to_owned) else {
        counter!(MESSAGES_DROPPED_COUNTER, "reason" => "missing_id").increment(1);
        warn!(message = %message.id, "dropping message without an id attribute");
        message.ack();
        return;
    };

    if let Some(older) = batch.insert(event_id, message) {
        counter!(DUPLICATE_MESSAGES_COUNTER).increment(1);
        older.ack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{AckLog, RecordingProcessor, Settlement};
    use persister_common::health::HealthRegistry;

    struct Harness {
        sender: mpsc::Sender<Message>,
        processor: Arc<RecordingProcessor>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(flush_size: usize, flush_interval: time::Duration) -> Harness {
        let (sender, receiver) = mpsc::channel(100);
        let processor = Arc::new(RecordingProcessor::default());
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("windower-0".to_owned(), ::time::Duration::seconds(30));
        let shutdown = CancellationToken::new();

        let windower = BatchWindower::new(
            "windower-0",
            Arc::new(Mutex::new(receiver)),
            processor.clone(),
            flush_size,
            flush_interval,
            time::Duration::from_secs(5),
            liveness,
        );
        let handle = tokio::spawn(windower.run(shutdown.clone()));

        Harness {
            sender,
            processor,
            shutdown,
            handle,
        }
    }

    /// Never settles anything within a reasonable flush timeout.
    struct SlowProcessor;

    #[async_trait]
    impl BatchProcessor for SlowProcessor {
        async fn process(&self, batch: Batch) {
            tokio::time::sleep(time::Duration::from_secs(10)).await;
            for (_, message) in batch {
                message.ack();
            }
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..50 {
            if check() {
                return;
            }
            tokio::time::sleep(time::Duration::from_millis(20)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn test_flushes_on_size() {
        let log = AckLog::default();
        let harness = start(2, time::Duration::from_secs(3600));

        for i in 0..2 {
            let message = log.message(&format!("t{i}"), Some(&format!("m{i}")), Vec::new());
            harness.sender.send(message).await.unwrap();
        }

        eventually(|| harness.processor.batches().len() == 1).await;
        assert_eq!(harness.processor.batches()[0].len(), 2);
        assert_eq!(log.count(Settlement::Ack), 2);
    }

    #[tokio::test]
    async fn test_flushes_on_interval() {
        let log = AckLog::default();
        let harness = start(100, time::Duration::from_millis(50));

        let message = log.message("t0", Some("m0"), Vec::new());
        harness.sender.send(message).await.unwrap();

        eventually(|| harness.processor.batches().len() == 1).await;
        assert_eq!(harness.processor.batches()[0], vec!["m0".to_owned()]);
    }

    #[tokio::test]
    async fn test_acks_older_duplicate_and_keeps_newer() {
        let log = AckLog::default();
        let harness = start(2, time::Duration::from_secs(3600));

        let first = log.message("t0", Some("m0"), Vec::new());
        let redelivered = log.message("t1", Some("m0"), Vec::new());
        let other = log.message("t2", Some("m1"), Vec::new());
        for message in [first, redelivered, other] {
            harness.sender.send(message).await.unwrap();
        }

        eventually(|| harness.processor.batches().len() == 1).await;
        // The duplicate never counts toward the flush size.
        assert_eq!(harness.processor.batches()[0].len(), 2);
        assert_eq!(log.settlements_of("t0"), vec![Settlement::Ack]);
        assert_eq!(harness.processor.transport_ids(), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_acks_and_drops_message_without_id() {
        let log = AckLog::default();
        let harness = start(1, time::Duration::from_secs(3600));

        harness
            .sender
            .send(log.message("t0", None, Vec::new()))
            .await
            .unwrap();
        harness
            .sender
            .send(log.message("t1", Some(""), Vec::new()))
            .await
            .unwrap();

        eventually(|| log.count(Settlement::Ack) == 2).await;
        assert!(harness.processor.batches().is_empty());
    }

    #[tokio::test]
    async fn test_flushes_on_shutdown() {
        let log = AckLog::default();
        let harness = start(100, time::Duration::from_secs(3600));

        harness
            .sender
            .send(log.message("t0", Some("m0"), Vec::new()))
            .await
            .unwrap();
        tokio::time::sleep(time::Duration::from_millis(20)).await;
        harness.shutdown.cancel();
        harness.handle.await.unwrap();

        assert_eq!(harness.processor.batches(), vec![vec!["m0".to_owned()]]);
        assert_eq!(log.count(Settlement::Ack), 1);
    }

    #[tokio::test]
    async fn test_flushes_when_channel_closes() {
        let log = AckLog::default();
        let Harness {
            sender,
            processor,
            handle,
            ..
        } = start(100, time::Duration::from_secs(3600));

        sender
            .send(log.message("t0", Some("m0"), Vec::new()))
            .await
            .unwrap();
        drop(sender);
        handle.await.unwrap();

        assert_eq!(processor.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_flush_nacks_held_messages() {
        let log = AckLog::default();
        let (sender, receiver) = mpsc::channel(10);
        let registry = HealthRegistry::new("liveness");
        let windower = BatchWindower::new(
            "windower-0",
            Arc::new(Mutex::new(receiver)),
            Arc::new(SlowProcessor),
            1,
            time::Duration::from_secs(3600),
            time::Duration::from_millis(50),
            registry.register("windower-0".to_owned(), ::time::Duration::seconds(30)),
        );
        let handle = tokio::spawn(windower.run(CancellationToken::new()));

        sender
            .send(log.message("t0", Some("m0"), Vec::new()))
            .await
            .unwrap();

        eventually(|| log.count(Settlement::Nack) == 1).await;
        assert_eq!(log.settlements_of("t0"), vec![Settlement::Nack]);

        drop(sender);
        tokio::time::timeout(time::Duration::from_secs(1), handle)
            .await
            .expect("windower did not stop")
            .unwrap();
    }
}
