//! In-process durable queue with visibility timeouts and redrive.
//!
//! All state sits behind one `tokio::sync::Mutex`; the visibility timeout is
//! the only mutual exclusion consumers see. Timeouts are detected lazily on
//! the next queue operation, and receivers sleep until the earliest pending
//! visibility change so a timed-out message is picked up promptly.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{DurableQueue, NackOutcome, QueueConfig, QueueError, RedrivePolicy, Result};
use crate::dlq::{DeadLetter, DeadLetterPublisher, DlqError};
use crate::message::{Delivery, DeliveryBatch, MessageId, OutboundMessage};
use crate::utils::retry::nack_delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Visible { at: Instant },
    InFlight { deadline: Instant },
    /// Exhausted but the dead-letter publish failed; retried on the next sweep.
    DeadLetterPending,
}

struct Entry {
    message: OutboundMessage,
    receive_count: u32,
    status: Status,
    seq: u64,
}

enum Failure {
    Requeued,
    Exhausted(Entry),
    NotInFlight,
}

#[derive(Default)]
struct State {
    entries: HashMap<MessageId, Entry>,
    /// Enqueue order.
    order: BTreeMap<u64, MessageId>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, message: OutboundMessage, receive_count: u32, status: Status) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.reinsert(Entry {
            message,
            receive_count,
            status,
            seq,
        });
    }

    fn reinsert(&mut self, entry: Entry) {
        self.order.insert(entry.seq, entry.message.id);
        self.entries.insert(entry.message.id, entry);
    }

    fn remove(&mut self, id: &MessageId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    /// Count one failed delivery of an in-flight message.
    fn record_failure(
        &mut self,
        id: &MessageId,
        redrive: Option<&RedrivePolicy>,
        visible_at: impl FnOnce(u32) -> Instant,
    ) -> Failure {
        let Some(entry) = self.entries.get_mut(id) else {
            return Failure::NotInFlight;
        };
        if !matches!(entry.status, Status::InFlight { .. }) {
            return Failure::NotInFlight;
        }

        entry.receive_count += 1;
        if redrive.is_some_and(|policy| policy.is_exhausted(entry.receive_count)) {
            return match self.remove(id) {
                Some(entry) => Failure::Exhausted(entry),
                None => Failure::NotInFlight,
            };
        }
        entry.status = Status::Visible {
            at: visible_at(entry.receive_count),
        };
        Failure::Requeued
    }

    /// Expire overdue in-flight messages and collect everything awaiting
    /// dead-lettering.
    fn sweep(&mut self, now: Instant, redrive: Option<&RedrivePolicy>) -> Vec<Entry> {
        let expired: Vec<MessageId> = self
            .entries
            .values()
            .filter(|e| matches!(e.status, Status::InFlight { deadline } if deadline <= now))
            .map(|e| e.message.id)
            .collect();
        let pending: Vec<MessageId> = self
            .entries
            .values()
            .filter(|e| e.status == Status::DeadLetterPending)
            .map(|e| e.message.id)
            .collect();

        let mut exhausted = Vec::new();
        for id in expired {
            debug!(message_id = %id, "Visibility timeout elapsed");
            if let Failure::Exhausted(entry) = self.record_failure(&id, redrive, |_| now) {
                exhausted.push(entry);
            }
        }
        exhausted.extend(pending.iter().filter_map(|id| self.remove(id)));
        exhausted
    }

    fn take_visible(&mut self, now: Instant, max: usize, deadline: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for id in self.order.values() {
            if deliveries.len() >= max {
                break;
            }
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if matches!(entry.status, Status::Visible { at } if at <= now) {
                entry.status = Status::InFlight { deadline };
                deliveries.push(Delivery {
                    message: entry.message.clone(),
                    receive_count: entry.receive_count,
                });
            }
        }
        deliveries
    }

    /// Earliest future instant at which a message becomes visible.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|e| match e.status {
                Status::Visible { at } if at > now => Some(at),
                Status::InFlight { deadline } => Some(deadline),
                _ => None,
            })
            .min()
    }
}

/// In-memory durable queue.
///
/// Cheap to share behind an `Arc`; every clone of the `Arc` sees the same
/// messages.
pub struct InMemoryQueue {
    name: String,
    config: QueueConfig,
    redrive: Option<RedrivePolicy>,
    state: Arc<Mutex<State>>,
    /// Signalled when messages may have become visible.
    ready: Notify,
    /// Signalled when capacity was freed.
    space: Arc<Notify>,
    available: AtomicBool,
}

impl InMemoryQueue {
    /// Create a queue without a dead-letter target. Failed messages are
    /// redelivered indefinitely.
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let name = name.into();
        info!(
            queue = %name,
            visibility_timeout = ?config.visibility_timeout,
            capacity = config.capacity,
            "In-memory queue initialized"
        );
        Self {
            name,
            config,
            redrive: None,
            state: Arc::new(Mutex::new(State::default())),
            ready: Notify::new(),
            space: Arc::new(Notify::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Dead-letter messages once they exceed `config.max_receive_count`.
    pub fn with_dead_letter(self, dead_letter: Arc<dyn DeadLetterPublisher>) -> Self {
        let max = self.config.max_receive_count;
        self.with_redrive(RedrivePolicy::new(max, dead_letter))
    }

    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = Some(policy);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn redrive_policy(&self) -> Option<&RedrivePolicy> {
        self.redrive.as_ref()
    }

    /// Messages held, visible or in flight.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages currently delivered and awaiting ack.
    pub async fn in_flight(&self) -> usize {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| matches!(e.status, Status::InFlight { .. }))
            .count()
    }

    /// Failed deliveries recorded for a held message.
    pub async fn receive_count(&self, id: &MessageId) -> Option<u32> {
        self.state
            .lock()
            .await
            .entries
            .get(id)
            .map(|e| e.receive_count)
    }

    /// Take every held message out of the queue, in enqueue order.
    ///
    /// Intended for operators draining a dead-letter queue.
    pub async fn drain(&self) -> Vec<OutboundMessage> {
        let mut state = self.state.lock().await;
        let order = std::mem::take(&mut state.order);
        let mut drained = Vec::with_capacity(order.len());
        for id in order.values() {
            if let Some(entry) = state.entries.remove(id) {
                drained.push(entry.message);
            }
        }
        drop(state);
        self.space.notify_waiters();
        drained
    }

    /// Simulate a destination outage: while unavailable, enqueue fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            warn!(queue = %self.name, "Queue marked unavailable");
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> QueueError {
        QueueError::DestinationUnavailable {
            queue: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Publish exhausted messages. A failed publish parks the message for
    /// the next sweep rather than losing it.
    ///
    /// Exhausted entries are already out of the visible set, so publishing
    /// runs on its own task and completes even if the caller is cancelled.
    async fn dead_letter(&self, exhausted: Vec<Entry>) {
        let Some(policy) = &self.redrive else {
            return;
        };
        if exhausted.is_empty() {
            return;
        }

        let publisher = Arc::clone(&policy.dead_letter);
        let state = Arc::clone(&self.state);
        let space = Arc::clone(&self.space);
        let queue = self.name.clone();
        let task = tokio::spawn(async move {
            let component = format!("queue:{}", queue);
            let mut freed = false;
            for mut entry in exhausted {
                warn!(
                    queue = %queue,
                    message_id = %entry.message.id,
                    receive_count = entry.receive_count,
                    source = %entry.message.source,
                    "Redrive exhausted, moving message to dead letter"
                );
                let dead_letter = DeadLetter::redrive_exhausted(
                    entry.message.clone(),
                    entry.receive_count,
                    &component,
                );
                match publisher.publish(dead_letter).await {
                    Ok(()) => freed = true,
                    Err(e) => {
                        error!(
                            queue = %queue,
                            message_id = %entry.message.id,
                            error = %e,
                            "Dead letter publish failed, parking message"
                        );
                        entry.status = Status::DeadLetterPending;
                        state.lock().await.reinsert(entry);
                    }
                }
            }
            if freed {
                space.notify_waiters();
            }
        });
        if let Err(e) = task.await {
            error!(queue = %self.name, error = %e, "Dead letter task failed");
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(name = "queue.enqueue", skip_all, fields(queue = %self.name, message_id = %message.id))]
    async fn enqueue(&self, message: OutboundMessage) -> Result<MessageId> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(self.unavailable("queue offline"));
        }

        let deadline = Instant::now() + self.config.enqueue_timeout;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let id = message.id;
                if state.entries.contains_key(&id) {
                    debug!("Message already held, ignoring duplicate enqueue");
                    return Ok(id);
                }
                if state.entries.len() < self.config.capacity {
                    state.insert(
                        message,
                        0,
                        Status::Visible {
                            at: Instant::now(),
                        },
                    );
                    drop(state);
                    self.ready.notify_waiters();
                    debug!("Message enqueued");
                    return Ok(id);
                }
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                warn!(capacity = self.config.capacity, "Enqueue timed out at capacity");
                return Err(self.unavailable(format!(
                    "at capacity ({}) for {:?}",
                    self.config.capacity, self.config.enqueue_timeout
                )));
            }
        }
    }

    #[tracing::instrument(name = "queue.receive", skip_all, fields(queue = %self.name, max = max))]
    async fn receive_batch(&self, max: usize, max_wait: Duration) -> Result<DeliveryBatch> {
        if max == 0 {
            return Err(QueueError::InvalidRequest(
                "batch size must be at least 1".to_string(),
            ));
        }

        let wait_until = Instant::now() + max_wait;
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            // Settle exhausted messages first. Nothing is marked in flight
            // until the final lock below, and no await follows it, so a
            // cancelled receive never strands a delivery.
            let exhausted = {
                let mut state = self.state.lock().await;
                state.sweep(Instant::now(), self.redrive.as_ref())
            };
            self.dead_letter(exhausted).await;

            let (deliveries, next_wake) = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let deliveries =
                    state.take_visible(now, max, now + self.config.visibility_timeout);
                (deliveries, state.next_wake(now))
            };

            if !deliveries.is_empty() {
                debug!(count = deliveries.len(), "Batch received");
                return Ok(DeliveryBatch {
                    queue: self.name.clone(),
                    deliveries,
                });
            }

            if Instant::now() >= wait_until {
                return Ok(DeliveryBatch {
                    queue: self.name.clone(),
                    deliveries: Vec::new(),
                });
            }
            let wake = next_wake.map_or(wait_until, |w| w.min(wait_until));
            tokio::select! {
                _ = &mut ready => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack_batch(&self, ids: &[MessageId]) -> Result<usize> {
        let removed = {
            let mut state = self.state.lock().await;
            ids.iter().filter(|id| state.remove(id).is_some()).count()
        };
        if removed > 0 {
            self.space.notify_waiters();
        }
        debug!(queue = %self.name, requested = ids.len(), removed, "Messages acked");
        Ok(removed)
    }

    async fn nack_batch(&self, ids: &[MessageId]) -> Result<NackOutcome> {
        let mut outcome = NackOutcome::default();
        let exhausted = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let mut exhausted = state.sweep(now, self.redrive.as_ref());
            for id in ids {
                let failure = state.record_failure(id, self.redrive.as_ref(), |count| {
                    now + nack_delay(
                        count,
                        self.config.nack_backoff_min,
                        self.config.nack_backoff_max,
                    )
                });
                match failure {
                    Failure::Requeued => outcome.requeued += 1,
                    Failure::Exhausted(entry) => {
                        outcome.dead_lettered += 1;
                        exhausted.push(entry);
                    }
                    Failure::NotInFlight => {
                        debug!(queue = %self.name, message_id = %id, "Nack for message not in flight");
                    }
                }
            }
            exhausted
        };
        self.ready.notify_waiters();
        self.dead_letter(exhausted).await;
        Ok(outcome)
    }
}

#[async_trait]
impl DeadLetterPublisher for InMemoryQueue {
    async fn publish(&self, dead_letter: DeadLetter) -> std::result::Result<(), DlqError> {
        for message in dead_letter.into_messages() {
            self.enqueue(message).await.map_err(|e| match e {
                QueueError::DestinationUnavailable { reason, .. } => DlqError::Full(reason),
                other => DlqError::PublishFailed(other.to_string()),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
