use std::collections::HashMap;

use persister_common::event::Event;
use serde::Deserialize;
use tracing::warn;

use crate::error::ExtractError;
use crate::metrics_consts::report_event_outcome;
use crate::source::Message;
use crate::windower::Batch;

/// The wire envelope published by clients.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    environment_id: String,
    /// Written by older publishers, only read when `environment_id` is empty.
    #[serde(default)]
    environment_namespace: String,
    event: Event,
}

/// Decode a payload into its environment and inner event.
pub fn decode(data: &[u8]) -> Result<(String, Event), ExtractError> {
    let envelope: Envelope = serde_json::from_slice(data)?;

    let environment_id = if envelope.environment_id.is_empty() {
        envelope.environment_namespace
    } else {
        envelope.environment_id
    };
    if environment_id.is_empty() {
        return Err(ExtractError::MissingEnvironment);
    }

    Ok((environment_id, envelope.event))
}

/// Decoded events of a batch, grouped by environment then keyed by event id, next to the
/// messages they came from.
#[derive(Default)]
pub struct Extracted {
    pub events: HashMap<String, HashMap<String, Event>>,
    pub messages: HashMap<String, Message>,
}

impl Extracted {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Decode every message of a batch. Malformed messages are acked here and never retried,
/// redelivering them cannot fix them.
pub fn extract(batch: Batch) -> Extracted {
    let mut extracted = Extracted::default();

    for (event_id, message) in batch {
        match decode(&message.data) {
            Ok((environment_id, event)) => {
                extracted
                    .events
                    .entry(environment_id)
                    .or_default()
                    .insert(event_id.clone(), event);
                extracted.messages.insert(event_id, message);
            }
            Err(e) => {
                warn!(event_id = %event_id, "dropping malformed message: {}", e);
                report_event_outcome("unknown", "bad_message");
                message.ack();
            }
        }
    }

    extracted
}
