use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::SourceError;
use crate::metrics_consts::MESSAGES_PUMPED_COUNTER;
use crate::source::{Message, MessageHandler, MessageSource};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Moves messages from a `MessageSource` onto the bounded windower channel, no faster
/// than `max_mps` messages per second.
pub struct RateLimitedPump {
    source: Arc<dyn MessageSource>,
    limiter: DirectLimiter,
    sender: mpsc::Sender<Message>,
}

impl RateLimitedPump {
    pub fn new(
        source: Arc<dyn MessageSource>,
        max_mps: NonZeroU32,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            source,
            limiter: RateLimiter::direct(Quota::per_second(max_mps)),
            sender,
        }
    }

    /// Pull until `shutdown` is cancelled or the source fails.
    ///
    /// The channel is closed when this returns, which makes the windowers flush and exit.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SourceError> {
        let source = self.source.clone();
        let handler = PumpHandler {
            limiter: self.limiter,
            sender: self.sender,
            shutdown: shutdown.clone(),
        };

        let result = source.pull(shutdown, &handler).await;
        drop(handler);

        match &result {
            Ok(_) => info!("message pump stopped"),
            Err(e) => error!("message pump failed: {}", e),
        }
        result
    }
}

struct PumpHandler {
    limiter: DirectLimiter,
    sender: mpsc::Sender<Message>,
    shutdown: CancellationToken,
}

#[async_trait]
impl MessageHandler for PumpHandler {
    async fn handle(&self, message: Message) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                message.nack();
                return;
            }
            _ = self.limiter.until_ready() => {}
        }

        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => {
                message.nack();
                return;
            }
            permit = self.sender.reserve() => permit,
        };

        match permit {
            Ok(permit) => {
                counter!(MESSAGES_PUMPED_COUNTER).increment(1);
                permit.send(message);
            }
            // Every windower is gone, let the bus redeliver.
            Err(_) => message.nack(),
        }
    }
}
