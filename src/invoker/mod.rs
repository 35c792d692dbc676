//! Consumer invocation.
//!
//! A [`ConsumerInvoker`] is an explicit pull-and-dispatch loop over one
//! [`DurableQueue`]:
//!
//! ```text
//! Received -> Processing -> AllAcked | PartiallyFailed | AllFailed | TimedOut
//! ```
//!
//! Handlers report per-message failures; only those are nacked, everything
//! else in the batch is acked individually. A batch that outlives the
//! invocation timeout is a full-batch failure: nothing is acked or nacked and
//! the messages come back once their visibility timeout elapses, except
//! those the handler acked early through its [`BatchContext`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::message::{Delivery, DeliveryBatch, MessageId};
use crate::queue::{millis, secs, DurableQueue, QueueError};
use crate::source::DEFAULT_BATCH_SIZE;

pub mod dedup;
pub mod stream;

pub use dedup::Deduplicating;
pub use stream::{EventBatchHandler, StreamInvoker, StreamOutcome};

/// Errors raised by consumer business logic.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Message {id} is invalid: {reason}")]
    InvalidMessage { id: MessageId, reason: String },

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),
}

/// Messages of a batch the handler failed to process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchItemFailures {
    failed: Vec<MessageId>,
}

impl BatchItemFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: MessageId) {
        if !self.failed.contains(&id) {
            self.failed.push(id);
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.failed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageId> {
        self.failed.iter()
    }
}

impl FromIterator<MessageId> for BatchItemFailures {
    fn from_iter<I: IntoIterator<Item = MessageId>>(iter: I) -> Self {
        let mut failures = Self::new();
        for id in iter {
            failures.push(id);
        }
        failures
    }
}

/// Per-invocation handle given to a batch handler.
///
/// Lets the handler ack messages before the batch completes, so they survive
/// an invocation timeout.
pub struct BatchContext {
    queue: Arc<dyn DurableQueue>,
    acked: Mutex<HashSet<MessageId>>,
}

impl BatchContext {
    pub fn new(queue: Arc<dyn DurableQueue>) -> Self {
        Self {
            queue,
            acked: Mutex::new(HashSet::new()),
        }
    }

    /// Ack messages now.
    pub async fn ack(&self, ids: &[MessageId]) -> Result<(), QueueError> {
        self.queue.ack_batch(ids).await?;
        self.acked.lock().await.extend(ids.iter().copied());
        Ok(())
    }

    /// Messages acked early so far.
    pub async fn acked(&self) -> HashSet<MessageId> {
        self.acked.lock().await.clone()
    }
}

/// Business logic invoked with a batch of messages.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &str;

    /// Process a batch.
    ///
    /// `Ok` with failures nacks only those messages; `Err` fails every
    /// message not acked early.
    async fn handle(
        &self,
        batch: &DeliveryBatch,
        ctx: &BatchContext,
    ) -> Result<BatchItemFailures, HandlerError>;
}

/// Business logic invoked once per message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (**self).handle(delivery).await
    }
}

/// Adapts a [`MessageHandler`] into a [`BatchHandler`].
///
/// Messages are handled in batch order; a failure is recorded and the rest
/// of the batch still runs.
pub struct PerMessage<H>(pub H);

#[async_trait]
impl<H: MessageHandler> BatchHandler for PerMessage<H> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn handle(
        &self,
        batch: &DeliveryBatch,
        _ctx: &BatchContext,
    ) -> Result<BatchItemFailures, HandlerError> {
        let mut failures = BatchItemFailures::new();
        for delivery in batch.iter() {
            let message = &delivery.message;
            let span = info_span!(
                "invoker.message",
                handler = %self.0.name(),
                message_id = %message.id,
                source = %message.source,
                receive_count = delivery.receive_count,
                trace_parent = message.trace.trace_parent.as_deref().unwrap_or(""),
                parent_span = message.trace.parent_span.as_deref().unwrap_or(""),
            );
            if let Err(e) = self.0.handle(delivery).instrument(span).await {
                warn!(handler = %self.0.name(), message_id = %message.id, error = %e, "Message failed");
                failures.push(message.id);
            }
        }
        Ok(failures)
    }
}

/// Final state of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Nothing was received.
    Empty,
    AllAcked,
    PartiallyFailed,
    AllFailed,
    /// Handler exceeded the invocation timeout.
    TimedOut,
}

/// Result of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub state: BatchState,
    pub received: usize,
    pub acked: usize,
    pub nacked: usize,
    pub dead_lettered: usize,
    /// Acked by the handler itself through its context.
    pub early_acked: usize,
}

impl BatchOutcome {
    fn empty() -> Self {
        Self {
            state: BatchState::Empty,
            received: 0,
            acked: 0,
            nacked: 0,
            dead_lettered: 0,
            early_acked: 0,
        }
    }
}

/// Invoker tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub batch_size: usize,
    #[serde(with = "millis", rename = "max_wait_ms")]
    pub max_wait: Duration,
    #[serde(with = "secs", rename = "invocation_timeout_secs")]
    pub invocation_timeout: Duration,
    /// Concurrent pollers per queue.
    pub workers: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait: Duration::from_secs(1),
            invocation_timeout: Duration::from_secs(30),
            workers: 1,
        }
    }
}

/// Running totals across invocations.
#[derive(Debug, Default)]
pub struct InvokerStats {
    batches: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time copy of [`InvokerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokerStatsSnapshot {
    pub batches: u64,
    pub acked: u64,
    pub nacked: u64,
    pub timed_out: u64,
}

impl InvokerStats {
    fn record(&self, outcome: &BatchOutcome) {
        if outcome.state == BatchState::Empty {
            return;
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.acked
            .fetch_add((outcome.acked + outcome.early_acked) as u64, Ordering::Relaxed);
        self.nacked.fetch_add(outcome.nacked as u64, Ordering::Relaxed);
        if outcome.state == BatchState::TimedOut {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> InvokerStatsSnapshot {
        InvokerStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Pull-and-dispatch loop over one queue.
pub struct ConsumerInvoker {
    queue: Arc<dyn DurableQueue>,
    handler: Arc<dyn BatchHandler>,
    config: InvokerConfig,
    stats: InvokerStats,
}

impl ConsumerInvoker {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        handler: Arc<dyn BatchHandler>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            stats: InvokerStats::default(),
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    pub fn stats(&self) -> InvokerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Receive one batch and process it.
    pub async fn poll_once(&self) -> Result<BatchOutcome, QueueError> {
        let batch = self
            .queue
            .receive_batch(self.config.batch_size, self.config.max_wait)
            .await?;
        self.process(batch).await
    }

    /// Invoke the handler on a received batch and settle every message.
    #[tracing::instrument(
        name = "invoker.batch",
        skip_all,
        fields(queue = %batch.queue, handler = %self.handler.name(), size = batch.len())
    )]
    pub async fn process(&self, batch: DeliveryBatch) -> Result<BatchOutcome, QueueError> {
        if batch.is_empty() {
            return Ok(BatchOutcome::empty());
        }

        let ctx = BatchContext::new(Arc::clone(&self.queue));
        let result =
            tokio::time::timeout(self.config.invocation_timeout, self.handler.handle(&batch, &ctx))
                .await;
        let early = ctx.acked().await;

        let failed: HashSet<MessageId> = match result {
            Err(_) => {
                warn!(
                    timeout = ?self.config.invocation_timeout,
                    early_acked = early.len(),
                    "Invocation timed out, batch returns after visibility timeout"
                );
                let outcome = BatchOutcome {
                    state: BatchState::TimedOut,
                    received: batch.len(),
                    acked: 0,
                    nacked: 0,
                    dead_lettered: 0,
                    early_acked: early.len(),
                };
                self.stats.record(&outcome);
                return Ok(outcome);
            }
            Ok(Err(e)) => {
                error!(error = %e, "Handler failed the whole batch");
                batch.ids().into_iter().collect()
            }
            Ok(Ok(failures)) => {
                let ids: HashSet<MessageId> = batch.ids().into_iter().collect();
                for id in failures.iter().filter(|id| !ids.contains(*id)) {
                    warn!(message_id = %id, "Handler reported failure for a message not in the batch");
                }
                failures.iter().copied().filter(|id| ids.contains(id)).collect()
            }
        };

        let (to_nack, to_ack): (Vec<MessageId>, Vec<MessageId>) = batch
            .ids()
            .into_iter()
            .filter(|id| !early.contains(id))
            .partition(|id| failed.contains(id));

        let acked = if to_ack.is_empty() {
            0
        } else {
            self.queue.ack_batch(&to_ack).await?
        };
        let nack = if to_nack.is_empty() {
            Default::default()
        } else {
            self.queue.nack_batch(&to_nack).await?
        };

        let state = if to_nack.is_empty() {
            BatchState::AllAcked
        } else if to_nack.len() == batch.len() {
            BatchState::AllFailed
        } else {
            BatchState::PartiallyFailed
        };

        let outcome = BatchOutcome {
            state,
            received: batch.len(),
            acked,
            nacked: nack.requeued + nack.dead_lettered,
            dead_lettered: nack.dead_lettered,
            early_acked: early.len(),
        };
        debug!(?outcome, "Batch settled");
        self.stats.record(&outcome);
        Ok(outcome)
    }

    /// Poll until shutdown. Shutdown interrupts waiting, never a running
    /// handler.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue.name(), handler = %self.handler.name(), "Invoker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.queue.receive_batch(self.config.batch_size, self.config.max_wait) => batch,
            };
            let result = match batch {
                Ok(batch) => self.process(batch).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(queue = %self.queue.name(), error = %e, "Invocation failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.max_wait) => {}
                }
            }
        }
        info!(queue = %self.queue.name(), "Invoker stopped");
    }

    /// Run `workers` concurrent pollers on the queue.
    pub fn spawn_workers(self: Arc<Self>, workers: usize) -> InvokerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = (0..workers.max(1))
            .map(|worker| {
                let invoker = Arc::clone(&self);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(
                    async move { invoker.run(shutdown).await }
                        .instrument(info_span!("invoker.worker", worker)),
                )
            })
            .collect();
        InvokerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to spawned invoker workers.
pub struct InvokerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl InvokerHandle {
    pub fn workers(&self) -> usize {
        self.tasks.len()
    }

    /// Signal shutdown and wait for every worker.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Invoker worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests;
