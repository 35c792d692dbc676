//! Dead letter infrastructure.
//!
//! Terminal holding area for work the pipeline gave up on: messages that
//! exhausted their redrive budget, events a route could not transform,
//! messages a destination refused past the retry budget, and change-log
//! batches a stream consumer kept failing.
//!
//! ## Topic Naming
//!
//! Dead letters carry a topic of the form `fanout.dlq.{route}` so an
//! operator can tell which route produced them.
//!
//! ## Usage
//!
//! ```ignore
//! let (publisher, mut dead_letters) = ChannelDeadLetterPublisher::new();
//! publisher
//!     .publish(DeadLetter::redrive_exhausted(message, 6, "queue:new-subscriber"))
//!     .await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::{ChangeEvent, EventKey};
use crate::message::{OutboundMessage, TraceContext};

/// Dead letter topic prefix. Full topic: `{prefix}.{route}`
pub const DLQ_TOPIC_PREFIX: &str = "fanout.dlq";

/// Build the dead letter topic for a route.
pub fn dlq_topic_for_route(route: &str) -> String {
    format!("{}.{}", DLQ_TOPIC_PREFIX, route)
}

/// Errors that can occur during dead letter operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Dead letter target not configured")]
    NotConfigured,

    #[error("Failed to publish dead letter: {0}")]
    PublishFailed(String),

    #[error("Dead letter target is full: {0}")]
    Full(String),
}

/// What was given up on.
#[derive(Debug, Clone)]
pub enum DeadLetterPayload {
    /// A transformed message that could not be delivered or processed.
    Message(OutboundMessage),
    /// A change event a route could not transform.
    Event(Arc<ChangeEvent>),
    /// A change-log batch a stream consumer kept failing.
    Events(Vec<Arc<ChangeEvent>>),
}

impl DeadLetterPayload {
    /// Keys of the originating change events.
    pub fn source_keys(&self) -> Vec<EventKey> {
        match self {
            DeadLetterPayload::Message(message) => vec![message.source.clone()],
            DeadLetterPayload::Event(event) => vec![event.key()],
            DeadLetterPayload::Events(events) => events.iter().map(|e| e.key()).collect(),
        }
    }
}

/// Why the work was dead-lettered.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterReason {
    /// Failed delivery count went past the queue's `max_receive_count`.
    RedriveExhausted { receive_count: u32 },
    /// The route's transform rejected the event.
    Malformed { route: String, error: String },
    /// Enqueue kept failing after bounded retries.
    DestinationUnavailable {
        route: String,
        attempts: u32,
        error: String,
    },
    /// A direct stream consumer kept failing a batch.
    StreamBatchFailed { attempts: u32, error: String },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::RedriveExhausted { receive_count } => {
                write!(f, "Redrive exhausted after {} failed deliveries", receive_count)
            }
            DeadLetterReason::Malformed { route, error } => {
                write!(f, "Malformed event for route {}: {}", route, error)
            }
            DeadLetterReason::DestinationUnavailable {
                route,
                attempts,
                error,
            } => write!(
                f,
                "Destination for route {} unavailable after {} attempts: {}",
                route, attempts, error
            ),
            DeadLetterReason::StreamBatchFailed { attempts, error } => {
                write!(f, "Stream batch failed after {} attempts: {}", attempts, error)
            }
        }
    }
}

/// Dead letter entry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub payload: DeadLetterPayload,
    pub reason: DeadLetterReason,
    /// Route the work belonged to, if known.
    pub route: Option<String>,
    /// Which component gave up.
    pub source_component: String,
    pub occurred_at: DateTime<Utc>,
    /// Additional context.
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    fn new(
        payload: DeadLetterPayload,
        reason: DeadLetterReason,
        route: Option<String>,
        source_component: &str,
    ) -> Self {
        Self {
            payload,
            reason,
            route,
            source_component: source_component.to_string(),
            occurred_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// A message that went past its queue's redrive budget.
    pub fn redrive_exhausted(
        message: OutboundMessage,
        receive_count: u32,
        source_component: &str,
    ) -> Self {
        let route = Some(message.route.clone());
        Self::new(
            DeadLetterPayload::Message(message),
            DeadLetterReason::RedriveExhausted { receive_count },
            route,
            source_component,
        )
    }

    /// An event the route's transform rejected.
    pub fn malformed(
        event: Arc<ChangeEvent>,
        route: &str,
        error: &str,
        source_component: &str,
    ) -> Self {
        Self::new(
            DeadLetterPayload::Event(event),
            DeadLetterReason::Malformed {
                route: route.to_string(),
                error: error.to_string(),
            },
            Some(route.to_string()),
            source_component,
        )
    }

    /// A message its destination kept refusing.
    pub fn destination_unavailable(
        message: OutboundMessage,
        attempts: u32,
        error: &str,
        source_component: &str,
    ) -> Self {
        let route = message.route.clone();
        Self::new(
            DeadLetterPayload::Message(message),
            DeadLetterReason::DestinationUnavailable {
                route: route.clone(),
                attempts,
                error: error.to_string(),
            },
            Some(route),
            source_component,
        )
    }

    /// A change-log batch that kept failing on the direct stream path.
    pub fn stream_batch_failed(
        events: Vec<Arc<ChangeEvent>>,
        attempts: u32,
        error: &str,
        source_component: &str,
    ) -> Self {
        Self::new(
            DeadLetterPayload::Events(events),
            DeadLetterReason::StreamBatchFailed {
                attempts,
                error: error.to_string(),
            },
            None,
            source_component,
        )
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// The dead-lettered message, if the payload is one.
    pub fn message(&self) -> Option<&OutboundMessage> {
        match &self.payload {
            DeadLetterPayload::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Dead letter topic for this entry.
    pub fn topic(&self) -> String {
        dlq_topic_for_route(self.route.as_deref().unwrap_or("unknown"))
    }

    /// Flatten into queue messages for a queue-backed dead letter target.
    ///
    /// Messages pass through unchanged. Events become one message each whose
    /// body carries the reason, the event type and the row image.
    pub fn into_messages(self) -> Vec<OutboundMessage> {
        let route = self
            .route
            .unwrap_or_else(|| self.source_component.clone());
        let reason = self.reason.to_string();
        let wrap = |event: &ChangeEvent| {
            OutboundMessage::new(
                route.clone(),
                event.key(),
                serde_json::json!({
                    "reason": reason,
                    "event_type": event.event_type().as_str(),
                    "attributes": event.to_json(),
                }),
                TraceContext::default(),
            )
        };
        match self.payload {
            DeadLetterPayload::Message(message) => vec![message],
            DeadLetterPayload::Event(event) => vec![wrap(event.as_ref())],
            DeadLetterPayload::Events(events) => events.iter().map(|e| wrap(e.as_ref())).collect(),
        }
    }
}

/// Trait for publishing dead letters.
///
/// Implementations handle the actual transport (queue, channel, log).
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Publisher that only logs.
///
/// Used when no dead letter target is configured.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            topic = %dead_letter.topic(),
            reason = %dead_letter.reason,
            source = %dead_letter.source_component,
            "Dead letter target not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory publisher using a channel.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            topic = %dead_letter.topic(),
            reason = %dead_letter.reason,
            "Publishing to channel dead letter target"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{attributes, EventType};

    fn message() -> OutboundMessage {
        OutboundMessage::new(
            "new-subscriber",
            EventKey::new("tok123", 4),
            serde_json::json!({"email_address": "a@b.com"}),
            TraceContext::default(),
        )
    }

    fn event() -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent::new(
            "tok123",
            4,
            EventType::Insert,
            attributes([("Type", "SubscriberToken")]),
            Utc::now(),
        ))
    }

    #[test]
    fn test_topic_naming() {
        assert_eq!(dlq_topic_for_route("new-subscriber"), "fanout.dlq.new-subscriber");
        let dl = DeadLetter::redrive_exhausted(message(), 6, "queue:new-subscriber");
        assert_eq!(dl.topic(), "fanout.dlq.new-subscriber");

        let dl = DeadLetter::stream_batch_failed(vec![event()], 3, "boom", "stream");
        assert_eq!(dl.topic(), "fanout.dlq.unknown");
    }

    #[test]
    fn test_redrive_exhausted() {
        let dl = DeadLetter::redrive_exhausted(message(), 6, "queue:new-subscriber");
        assert_eq!(dl.reason, DeadLetterReason::RedriveExhausted { receive_count: 6 });
        assert_eq!(dl.payload.source_keys(), vec![EventKey::new("tok123", 4)]);
        assert!(dl.message().is_some());
        assert!(dl.reason.to_string().contains("6 failed deliveries"));
    }

    #[test]
    fn test_malformed_carries_event() {
        let dl = DeadLetter::malformed(event(), "send-newsletter", "missing IssueTitle", "router")
            .with_metadata("partition", "tok123");
        assert!(dl.message().is_none());
        assert_eq!(dl.route.as_deref(), Some("send-newsletter"));
        assert_eq!(dl.metadata.get("partition").map(String::as_str), Some("tok123"));
    }

    #[test]
    fn test_into_messages() {
        let original = message();
        let id = original.id;
        let dl = DeadLetter::redrive_exhausted(original, 6, "queue");
        let messages = dl.into_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);

        let dl = DeadLetter::stream_batch_failed(vec![event(), event()], 3, "boom", "stream");
        let messages = dl.into_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].route, "stream");
        assert_eq!(messages[0].body["event_type"], "INSERT");
        assert_eq!(messages[0].body["attributes"]["Type"], "SubscriberToken");
        assert!(messages[0].body["reason"]
            .as_str()
            .unwrap()
            .contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_channel_publisher() {
        let (publisher, mut rx) = ChannelDeadLetterPublisher::new();
        publisher
            .publish(DeadLetter::destination_unavailable(message(), 5, "full", "router"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert!(matches!(
            received.reason,
            DeadLetterReason::DestinationUnavailable { attempts: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_channel_publisher_closed() {
        let (publisher, rx) = ChannelDeadLetterPublisher::new();
        drop(rx);
        let result = publisher
            .publish(DeadLetter::redrive_exhausted(message(), 6, "queue"))
            .await;
        assert!(matches!(result, Err(DlqError::PublishFailed(_))));
    }

    #[tokio::test]
    async fn test_noop_publisher() {
        let publisher = NoopDeadLetterPublisher;
        assert!(!publisher.is_configured());
        publisher
            .publish(DeadLetter::redrive_exhausted(message(), 6, "queue"))
            .await
            .unwrap();
    }
}
