//! The contract between the message bus and the pipeline.
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SourceError;
use crate::metrics_consts::MESSAGES_UNSETTLED_COUNTER;

/// Attribute carrying the id the publisher assigned to the event.
pub const ID_ATTRIBUTE: &str = "id";

/// Settles a single delivery with the message bus.
///
/// Consuming `self` makes acking or nacking a message twice a compile error.
pub trait Acknowledge: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// A delivery from the message bus. Must be settled exactly once with `ack` or `nack`.
///
/// A message dropped without being settled is nacked, so abandoning a batch (a timed out
/// flush, a cancelled task) hands it back to the bus instead of losing it.
pub struct Message {
    /// Transport level id, unique per delivery.
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    acknowledger: Option<Box<dyn Acknowledge>>,
}

impl Message {
    pub fn new(
        id: String,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
        acknowledger: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            id,
            data,
            attributes,
            acknowledger: Some(acknowledger),
        }
    }

    /// The publisher assigned event id, used for de-duplication and as the warehouse row id.
    pub fn event_id(&self) -> Option<&str> {
        self.attributes
            .get(ID_ATTRIBUTE)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn ack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.ack()
        }
    }

    pub fn nack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.nack()
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            counter!(MESSAGES_UNSETTLED_COUNTER).increment(1);
            warn!(message = %self.id, "nacking message dropped without being settled");
            acknowledger.nack();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attributes", &self.attributes)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Receives every message delivered by a `MessageSource`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

/// A subscription that delivers messages with at-least-once semantics.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Deliver messages to `handler` until `shutdown` is cancelled or pulling fails.
    async fn pull(
        &self,
        shutdown: CancellationToken,
        handler: &dyn MessageHandler,
    ) -> Result<(), SourceError>;
}
