//! Kafka backed `MessageSource`.
//!
//! Offsets are stored manually and committed in the background. Messages of a partition are
//! settled out of order by concurrent windowers, so the stored offset only ever advances to
//! the lowest offset still in flight. A nacked message is produced again at the tail of its
//! topic and only counts as settled once that delivery succeeded, which gives the redelivery
//! a pub/sub nack would on a log based bus.
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use metrics::counter;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message as KafkaMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::SourceError;
use crate::source::{Acknowledge, Message, MessageHandler, MessageSource};

/// Settlement state of the offsets handed out for one partition.
#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_settled: Option<i64>,
    stored: Option<i64>,
}

impl PartitionOffsets {
    fn track(&mut self, offset: i64) {
        self.in_flight.insert(offset);
    }

    /// Mark `offset` settled. Returns the next offset to store when the low watermark moved.
    fn settle(&mut self, offset: i64) -> Option<i64> {
        self.in_flight.remove(&offset);
        let highest = self.highest_settled.map_or(offset, |h| h.max(offset));
        self.highest_settled = Some(highest);

        // The stored offset is the next one to consume.
        let watermark = match self.in_flight.first() {
            Some(lowest) => *lowest,
            None => highest + 1,
        };
        if self.stored.is_some_and(|stored| stored >= watermark) {
            return None;
        }
        self.stored = Some(watermark);
        Some(watermark)
    }
}

/// Stores consumer offsets in partition order, whatever order messages are settled in.
struct OffsetStore {
    consumer: Arc<StreamConsumer>,
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl OffsetStore {
    fn new(consumer: Arc<StreamConsumer>) -> Self {
        Self {
            consumer,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((topic.to_owned(), partition))
            .or_default()
            .track(offset);
    }

    fn settle(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(next) = partitions
            .entry((topic.to_owned(), partition))
            .or_default()
            .settle(offset)
        else {
            return;
        };

        // Stored under the lock so that concurrent settlements can't store out of order.
        if let Err(e) = self.consumer.store_offset(topic, partition, next) {
            counter!("persister_kafka_offset_store_errors_total").increment(1);
            error!(partition, offset = next, "failed to store offset: {}", e);
        }
    }
}

pub struct KafkaMessageSource {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    offsets: Arc<OffsetStore>,
}

impl KafkaMessageSource {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            );

        if config.kafka_tls {
            for client_config in [&mut consumer_config, &mut producer_config] {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
        };

        debug!("rdkafka consumer configuration: {:?}", consumer_config);
        let consumer: StreamConsumer = consumer_config.create()?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;
        let producer: FutureProducer = producer_config.create()?;

        info!("subscribed to {}", config.kafka_consumer_topic);

        let consumer = Arc::new(consumer);
        Ok(Self {
            offsets: Arc::new(OffsetStore::new(consumer.clone())),
            consumer,
            producer,
        })
    }

    fn to_message(&self, delivered: &BorrowedMessage<'_>) -> Message {
        let mut attributes = HashMap::new();
        let mut headers = None;
        if let Some(borrowed) = delivered.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) {
                    attributes.insert(header.key.to_owned(), value.to_owned());
                }
            }
            headers = Some(borrowed.detach());
        }

        let payload = delivered.payload().unwrap_or_default().to_vec();
        self.offsets
            .track(delivered.topic(), delivered.partition(), delivered.offset());
        let acknowledger = KafkaAcknowledger {
            offsets: self.offsets.clone(),
            producer: self.producer.clone(),
            topic: delivered.topic().to_owned(),
            partition: delivered.partition(),
            offset: delivered.offset(),
            key: delivered.key().map(<[u8]>::to_vec),
            payload: payload.clone(),
            headers,
        };

        Message::new(
            format!(
                "{}-{}-{}",
                delivered.topic(),
                delivered.partition(),
                delivered.offset()
            ),
            payload,
            attributes,
            Box::new(acknowledger),
        )
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn pull(
        &self,
        shutdown: CancellationToken,
        handler: &dyn MessageHandler,
    ) -> Result<(), SourceError> {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                delivered = self.consumer.recv() => self.to_message(&delivered?),
            };

            handler.handle(message).await;
        }
    }
}

struct KafkaAcknowledger {
    offsets: Arc<OffsetStore>,
    producer: FutureProducer,
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: Option<OwnedHeaders>,
}

impl KafkaAcknowledger {
    fn settle(&self) {
        self.offsets.settle(&self.topic, self.partition, self.offset);
    }

    fn report_requeue_failure(&self, e: &dyn std::fmt::Display) {
        // The offset stays in flight, so nothing past it is committed and a restart
        // redelivers it.
        counter!("persister_kafka_redelivery_errors_total").increment(1);
        error!(
            partition = self.partition,
            offset = self.offset,
            "failed to requeue message: {}",
            e
        );
    }
}

impl Acknowledge for KafkaAcknowledger {
    fn ack(self: Box<Self>) {
        self.settle();
    }

    fn nack(self: Box<Self>) {
        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.topic).payload(self.payload.as_slice());
        if let Some(key) = &self.key {
            record = record.key(key.as_slice());
        }
        if let Some(headers) = &self.headers {
            record = record.headers(headers.clone());
        }

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                self.report_requeue_failure(&e);
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                partition = self.partition,
                offset = self.offset,
                "no runtime to await the requeue, leaving offset in flight"
            );
            return;
        };

        // The offset is only settled once the copy is safely in the topic.
        runtime.spawn(async move {
            match delivery.await {
                Ok(Ok(_)) => {
                    counter!("persister_kafka_redeliveries_total").increment(1);
                    self.settle();
                }
                Ok(Err((e, _))) => self.report_requeue_failure(&e),
                Err(_) => self.report_requeue_failure(&"delivery cancelled"),
            }
        });
    }
}
