//! Durable destination queues.
//!
//! This module contains:
//! - `DurableQueue` trait: batched at-least-once delivery to one consumer group
//! - `QueueConfig` / `RedrivePolicy`: visibility timeout, capacity and redrive
//! - `InMemoryQueue`: the in-process implementation
//!
//! Delivery contract: a received message is invisible to other receivers
//! until it is acked, nacked or its visibility timeout elapses. A nack or
//! timeout is a failed delivery and bumps the message's receive count by one;
//! once that count exceeds the redrive policy's `max_receive_count` the
//! message moves to the dead-letter target instead of becoming visible again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::dlq::{DeadLetterPublisher, DlqError};
use crate::message::{DeliveryBatch, MessageId, OutboundMessage};

pub mod memory;

pub use memory::InMemoryQueue;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Destination '{queue}' unavailable: {reason}")]
    DestinationUnavailable { queue: String, reason: String },

    #[error("Invalid receive request: {0}")]
    InvalidRequest(String),

    #[error("Dead letter publish failed: {0}")]
    DeadLetter(#[from] DlqError),
}

impl QueueError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::DestinationUnavailable { .. })
    }
}

/// Result of a nack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackOutcome {
    /// Messages scheduled for redelivery.
    pub requeued: usize,
    /// Messages moved to the dead-letter target.
    pub dead_lettered: usize,
}

/// A destination buffering layer with batched at-least-once delivery.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Queue name, used in logs and dead letters.
    fn name(&self) -> &str;

    /// Append a message. Waits briefly under backpressure when full.
    async fn enqueue(&self, message: OutboundMessage) -> Result<MessageId>;

    /// Receive up to `max` visible messages, waiting up to `max_wait` while
    /// none are visible. Returns an empty batch when the wait elapses.
    async fn receive_batch(&self, max: usize, max_wait: Duration) -> Result<DeliveryBatch>;

    /// Acknowledge processed messages. Returns how many were removed.
    ///
    /// Unknown ids (already acked or dead-lettered) are ignored.
    async fn ack_batch(&self, ids: &[MessageId]) -> Result<usize>;

    /// Return in-flight messages for redelivery after a backoff.
    ///
    /// Ids that are not currently in flight are ignored.
    async fn nack_batch(&self, ids: &[MessageId]) -> Result<NackOutcome>;
}

/// Default visibility timeout.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default failed-delivery budget before dead-lettering.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;
/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(with = "secs", rename = "visibility_timeout_secs")]
    pub visibility_timeout: Duration,
    /// Messages held (visible and in flight) before enqueue blocks.
    pub capacity: usize,
    #[serde(with = "millis", rename = "enqueue_timeout_ms")]
    pub enqueue_timeout: Duration,
    #[serde(with = "millis", rename = "nack_backoff_min_ms")]
    pub nack_backoff_min: Duration,
    #[serde(with = "millis", rename = "nack_backoff_max_ms")]
    pub nack_backoff_max: Duration,
    /// Failed deliveries tolerated before a message is dead-lettered.
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            capacity: DEFAULT_CAPACITY,
            enqueue_timeout: Duration::from_secs(1),
            nack_backoff_min: Duration::from_millis(100),
            nack_backoff_max: Duration::from_secs(20),
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        }
    }
}

impl QueueConfig {
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    pub fn with_nack_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.nack_backoff_min = min;
        self.nack_backoff_max = max;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }
}

/// Where exhausted messages go.
#[derive(Clone)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
    pub dead_letter: Arc<dyn DeadLetterPublisher>,
}

impl RedrivePolicy {
    pub fn new(max_receive_count: u32, dead_letter: Arc<dyn DeadLetterPublisher>) -> Self {
        Self {
            max_receive_count,
            dead_letter,
        }
    }

    /// Whether a message with `receive_count` failed deliveries is exhausted.
    pub fn is_exhausted(&self, receive_count: u32) -> bool {
        receive_count > self.max_receive_count
    }
}

impl std::fmt::Debug for RedrivePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedrivePolicy")
            .field("max_receive_count", &self.max_receive_count)
            .finish_non_exhaustive()
    }
}

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
