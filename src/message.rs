//! Messages routed to consumer queues.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventKey;

/// Unique message identifier, assigned when a route produces a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Distributed-trace correlation copied from the originating event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_parent: Option<String>,
    pub parent_span: Option<String>,
}

impl TraceContext {
    pub fn is_empty(&self) -> bool {
        self.trace_parent.is_none() && self.parent_span.is_none()
    }
}

/// A transformed change event on its way to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    /// Route that produced the message.
    pub route: String,
    /// Originating change event.
    pub source: EventKey,
    /// Consumer-specific payload.
    pub body: serde_json::Value,
    pub trace: TraceContext,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(
        route: impl Into<String>,
        source: EventKey,
        body: serde_json::Value,
        trace: TraceContext,
    ) -> Self {
        Self {
            id: MessageId::new(),
            route: route.into(),
            source,
            body,
            trace,
            created_at: Utc::now(),
        }
    }

    /// Deserialize the body into a typed message.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// A message handed to a consumer, with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: OutboundMessage,
    /// Failed deliveries so far (nacks and visibility timeouts).
    pub receive_count: u32,
}

impl Delivery {
    pub fn id(&self) -> MessageId {
        self.message.id
    }
}

/// Ordered messages handed to one consumer invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryBatch {
    /// Queue the batch was received from.
    pub queue: String,
    pub deliveries: Vec<Delivery>,
}

impl DeliveryBatch {
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.deliveries.iter().map(Delivery::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delivery> {
        self.deliveries.iter()
    }
}
