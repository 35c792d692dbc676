//! Change-log source.
//!
//! This module contains:
//! - `ChangeSource` trait: subscribe to the table's change log
//! - `ChangeStream` trait: pull batches of events from a subscription
//! - Subscription options and checkpoints
//! - Implementations: in-memory change log
//!
//! Guarantees: events are ordered by sequence number within a partition and
//! unordered across partitions. Emission is at-least-once; resuming from a
//! checkpoint replays everything after it, so readers must be idempotent on
//! `(partition_key, sequence_number)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::event::ChangeEvent;
use crate::utils::retry::source_backoff;

pub mod memory;

pub use memory::InMemoryChangeLog;

/// Default number of events per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Errors that can occur while reading the change log.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Change log unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Subscription closed")]
    Closed,
}

impl SourceError {
    /// Transient errors are retried with backoff; the log is durable so no
    /// data is lost while waiting.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// Replay the full retained history.
    #[default]
    Earliest,
    /// Only events appended after the subscription was created.
    Latest,
}

/// Options for a change-log subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Starting position for partitions without a checkpoint.
    pub start: StartingPosition,
    /// Maximum events per batch.
    pub batch_size: usize,
    /// Only read these partitions. `None` reads all.
    pub partition_filter: Option<Vec<String>>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start: StartingPosition::Earliest,
            batch_size: DEFAULT_BATCH_SIZE,
            partition_filter: None,
        }
    }
}

impl SubscribeOptions {
    /// Read from the oldest retained record.
    pub fn earliest() -> Self {
        Self::default()
    }

    /// Read only new records.
    pub fn latest() -> Self {
        Self {
            start: StartingPosition::Latest,
            ..Self::default()
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Restrict the subscription to the given partitions.
    pub fn with_partitions(mut self, partitions: Vec<String>) -> Self {
        self.partition_filter = Some(partitions);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SourceError::InvalidSubscription(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn includes(&self, partition_key: &str) -> bool {
        match &self.partition_filter {
            None => true,
            Some(partitions) => partitions.iter().any(|p| p == partition_key),
        }
    }
}

/// Last delivered sequence number per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    positions: BTreeMap<String, u64>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered sequence number for a partition.
    pub fn position(&self, partition_key: &str) -> Option<u64> {
        self.positions.get(partition_key).copied()
    }

    /// Record delivery of `sequence_number`. Never moves backwards.
    pub fn advance(&mut self, partition_key: &str, sequence_number: u64) {
        let entry = self
            .positions
            .entry(partition_key.to_string())
            .or_insert(0);
        if sequence_number > *entry {
            *entry = sequence_number;
        }
    }

    /// All recorded positions.
    pub fn positions(&self) -> &BTreeMap<String, u64> {
        &self.positions
    }
}

/// A subscription to a change log.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next batch of at most `batch_size` events.
    ///
    /// Waits up to `max_wait` for new events and returns an empty batch if
    /// none arrive.
    async fn next_batch(&mut self, max_wait: Duration) -> Result<Vec<Arc<ChangeEvent>>>;

    /// Position after the last delivered batch.
    fn checkpoint(&self) -> Checkpoint;
}

/// Interface to a table's change log.
///
/// Implementations:
/// - `InMemoryChangeLog`: in-process log for standalone mode and tests
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Start a new subscription.
    async fn subscribe(&self, options: SubscribeOptions) -> Result<Box<dyn ChangeStream>>;

    /// Resume a subscription after `checkpoint`.
    ///
    /// Partitions absent from the checkpoint follow `options.start`.
    async fn resume(
        &self,
        options: SubscribeOptions,
        checkpoint: Checkpoint,
    ) -> Result<Box<dyn ChangeStream>>;
}

/// Pull the next batch, retrying transient source errors with backoff.
///
/// Returns `Ok(None)` once `shutdown` is signalled. Empty batches are
/// returned as-is so the caller can observe idle polls.
pub async fn poll_batch(
    stream: &mut Box<dyn ChangeStream>,
    poll_wait: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Vec<Arc<ChangeEvent>>>> {
    let mut backoff = source_backoff().build();
    loop {
        if *shutdown.borrow() {
            return Ok(None);
        }

        let batch = tokio::select! {
            _ = shutdown.changed() => return Ok(None),
            batch = stream.next_batch(poll_wait) => batch,
        };

        match batch {
            Ok(events) => return Ok(Some(events)),
            Err(e) if e.is_transient() => {
                let delay = backoff.next().unwrap_or(Duration::from_secs(5));
                warn!(error = %e, delay = ?delay, "Change log unavailable, retrying");
                tokio::select! {
                    _ = shutdown.changed() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Flatten a subscription into a lazy, infinite stream of single events.
///
/// Empty polls are skipped; the stream ends only after yielding an error.
pub fn into_event_stream(
    stream: Box<dyn ChangeStream>,
    poll_wait: Duration,
) -> BoxStream<'static, Result<Arc<ChangeEvent>>> {
    stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        loop {
            match stream.next_batch(poll_wait).await {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => {
                    let items: Vec<Result<Arc<ChangeEvent>>> = batch.into_iter().map(Ok).collect();
                    return Some((stream::iter(items), Some(stream)));
                }
                Err(e) => return Some((stream::iter(vec![Err(e)]), None)),
            }
        }
    })
    .flatten()
    .boxed()
}
