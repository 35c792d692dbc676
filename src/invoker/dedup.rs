//! Idempotent message handling.
//!
//! Delivery is at-least-once, so a handler may see the same source event
//! more than once (redelivery after a timeout, a router retry that actually
//! landed). [`Deduplicating`] skips messages whose source event key was
//! already handled successfully.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{HandlerError, MessageHandler};
use crate::event::EventKey;
use crate::message::Delivery;

/// Keys remembered before the oldest are forgotten.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Seen {
    keys: HashSet<EventKey>,
    order: VecDeque<EventKey>,
    /// Keys whose handling is running right now.
    in_progress: HashSet<EventKey>,
}

/// Outcome of claiming a key before handling.
enum Claim {
    Handled,
    InProgress,
    Reserved,
}

/// Wraps a handler so each source event is handled at most once per window.
///
/// A key is reserved before the inner handler runs and only recorded after it
/// succeeds; failures stay eligible for redelivery. A concurrent delivery of a
/// reserved key fails, so the queue redelivers it once the first attempt has
/// settled.
pub struct Deduplicating<H> {
    inner: H,
    capacity: usize,
    // Never held across an await; released from `Drop` on cancellation.
    seen: Mutex<Seen>,
}

/// Releases a reservation when handling ends, including when the handler
/// future is dropped by an invocation timeout.
struct Reservation<'a, H> {
    owner: &'a Deduplicating<H>,
    key: EventKey,
    succeeded: bool,
}

impl<H> Drop for Reservation<'_, H> {
    fn drop(&mut self) {
        let mut seen = self.owner.lock();
        seen.in_progress.remove(&self.key);
        if self.succeeded && seen.keys.insert(self.key.clone()) {
            seen.order.push_back(self.key.clone());
            while seen.order.len() > self.owner.capacity {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.keys.remove(&oldest);
                }
            }
        }
    }
}

impl<H> Deduplicating<H> {
    fn lock(&self) -> MutexGuard<'_, Seen> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, key: &EventKey) -> Claim {
        let mut seen = self.lock();
        if seen.keys.contains(key) {
            Claim::Handled
        } else if !seen.in_progress.insert(key.clone()) {
            Claim::InProgress
        } else {
            Claim::Reserved
        }
    }
}

impl<H: MessageHandler> Deduplicating<H> {
    pub fn new(inner: H) -> Self {
        Self::with_capacity(inner, DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Whether `key` has been handled.
    pub async fn has_seen(&self, key: &EventKey) -> bool {
        self.lock().keys.contains(key)
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Deduplicating<H> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let key = &delivery.message.source;
        match self.claim(key) {
            Claim::Handled => {
                debug!(source = %key, message_id = %delivery.message.id, "Duplicate delivery skipped");
                return Ok(());
            }
            Claim::InProgress => {
                debug!(source = %key, message_id = %delivery.message.id, "Duplicate delivery in progress elsewhere");
                return Err(HandlerError::Failed(format!(
                    "Source event {} is being handled by another delivery",
                    key
                )));
            }
            Claim::Reserved => {}
        }

        let mut reservation = Reservation {
            owner: self,
            key: key.clone(),
            succeeded: false,
        };
        self.inner.handle(delivery).await?;
        reservation.succeeded = true;
        Ok(())
    }
}
