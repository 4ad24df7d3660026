use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one subscriber connection. Opaque to the core.
pub type DestinationId = String;

/// Event name used when the send primitive receives an aggregated batch.
pub const BATCH_EVENT: &str = "batch";

/// Anything that can travel through the fan-out layer.
///
/// Payloads only need to be serializable: the batcher measures them by
/// encoding, and the transport decides the final wire format.
pub trait Payload: Serialize + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryClass {
    /// Buffered like `Batched`; kept distinct so producers can tag one-off events.
    Individual,
    #[default]
    Batched,
    /// Bypasses batching and is sent alone, immediately.
    Critical,
}

/// One event queued for one destination.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage<P> {
    pub destination_id: DestinationId,
    pub event_name: String,
    pub payload: P,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_class: DeliveryClass,
}

impl<P> OutboundMessage<P> {
    pub fn new(destination_id: impl Into<String>, event_name: impl Into<String>, payload: P) -> Self {
        Self {
            destination_id: destination_id.into(),
            event_name: event_name.into(),
            payload,
            enqueued_at: Utc::now(),
            delivery_class: DeliveryClass::default(),
        }
    }

    #[must_use]
    pub fn with_class(mut self, delivery_class: DeliveryClass) -> Self {
        self.delivery_class = delivery_class;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.delivery_class == DeliveryClass::Critical
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry<P> {
    pub event: String,
    pub payload: P,
}

/// Aggregated payload handed to the send primitive on every flush.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEnvelope<P> {
    pub batch_id: Uuid,
    pub messages: Vec<BatchEntry<P>>,
    pub batch_size: usize,
    pub timestamp: DateTime<Utc>,
}

impl<P> BatchEnvelope<P> {
    /// Builds an envelope preserving the enqueue order of `messages`.
    pub fn from_messages(messages: Vec<OutboundMessage<P>>) -> Self {
        let messages: Vec<BatchEntry<P>> = messages
            .into_iter()
            .map(|message| BatchEntry {
                event: message.event_name,
                payload: message.payload,
            })
            .collect();

        Self {
            batch_id: Uuid::new_v4(),
            batch_size: messages.len(),
            messages,
            timestamp: Utc::now(),
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &str> + '_ {
        self.messages.iter().map(|entry| entry.event.as_str())
    }
}

/// What a destination actually receives: either one message or one batch.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Delivery<P> {
    Single(P),
    Batch(BatchEnvelope<P>),
}

impl<P> Delivery<P> {
    /// Number of logical messages carried.
    pub fn message_count(&self) -> usize {
        match self {
            Delivery::Single(_) => 1,
            Delivery::Batch(batch) => batch.batch_size,
        }
    }

    pub fn as_batch(&self) -> Option<&BatchEnvelope<P>> {
        match self {
            Delivery::Batch(batch) => Some(batch),
            Delivery::Single(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_preserves_enqueue_order() {
        let messages = (0..4)
            .map(|i| OutboundMessage::new("sid_1", format!("tick-{i}"), json!({ "seq": i })))
            .collect();

        let envelope = BatchEnvelope::from_messages(messages);

        assert_eq!(envelope.batch_size, 4);
        let events: Vec<&str> = envelope.events().collect();
        assert_eq!(events, vec!["tick-0", "tick-1", "tick-2", "tick-3"]);
    }

    #[test]
    fn test_delivery_serializes_untagged() {
        let single: Delivery<serde_json::Value> = Delivery::Single(json!({ "price": 1.5 }));
        assert_eq!(serde_json::to_value(&single).unwrap(), json!({ "price": 1.5 }));

        let batch = Delivery::Batch(BatchEnvelope::from_messages(vec![OutboundMessage::new(
            "sid_1",
            "progress",
            json!(42),
        )]));
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["batch_size"], json!(1));
        assert_eq!(value["messages"][0]["event"], json!("progress"));
        assert_eq!(value["messages"][0]["payload"], json!(42));
    }

    #[test]
    fn test_default_class_is_batched() {
        let message = OutboundMessage::new("sid_1", "alert", ());
        assert_eq!(message.delivery_class, DeliveryClass::Batched);
        assert!(!message.is_critical());
        assert!(message.with_class(DeliveryClass::Critical).is_critical());
    }
}
