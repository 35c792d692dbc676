//! Fan-out router.
//!
//! Evaluates every registered route against every change event. An event may
//! match zero, one or many routes; each match is transformed and enqueued to
//! that route's destination. Failures are isolated per (route, event):
//! - a transform failure drops the event for that route, is counted and
//!   dead-lettered
//! - an enqueue failure is retried with backoff, then escalated to the
//!   dead-letter publisher
//!
//! Within a route events are processed in order, so events from one
//! partition reach the destination in source order. The [`FanoutRouter::run`]
//! loop gives every route its own ordered worker: a route retrying against
//! an unavailable destination falls behind on its own while the others keep
//! up. The checkpoint only moves past a batch once every route has finished
//! it.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backon::Retryable;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dlq::{DeadLetter, DeadLetterPublisher, NoopDeadLetterPublisher};
use crate::error::PipelineError;
use crate::event::{ChangeEvent, EventKey};
use crate::filter::{PatternError, RoutePattern};
use crate::message::OutboundMessage;
use crate::queue::{DurableQueue, QueueError};
use crate::source::{poll_batch, ChangeStream, Checkpoint};
use crate::transform::{EventTransformer, MessageTemplate, TemplateError};
use crate::utils::retry::enqueue_backoff;

/// Default enqueue retries before escalation.
pub const DEFAULT_ENQUEUE_RETRIES: usize = 5;
/// Default wait for a change-log batch.
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(1);

const COMPONENT: &str = "router";

/// Errors building a router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Duplicate route id '{0}'")]
    DuplicateRoute(String),

    #[error("Route '{route}' has an invalid pattern: {source}")]
    Pattern {
        route: String,
        #[source]
        source: PatternError,
    },

    #[error("Route '{route}' has an invalid template: {source}")]
    Template {
        route: String,
        #[source]
        source: TemplateError,
    },
}

/// One static route: filter, transform, destination.
pub struct RouteDefinition {
    id: String,
    pattern: RoutePattern,
    transformer: EventTransformer,
    destination: Arc<dyn DurableQueue>,
}

impl RouteDefinition {
    pub fn new(
        id: impl Into<String>,
        pattern: RoutePattern,
        transformer: EventTransformer,
        destination: Arc<dyn DurableQueue>,
    ) -> Self {
        Self {
            id: id.into(),
            pattern,
            transformer,
            destination,
        }
    }

    /// Build a route from a JSON filter pattern and a message template.
    pub fn from_template(
        id: impl Into<String>,
        pattern: &str,
        template: &str,
        destination: Arc<dyn DurableQueue>,
    ) -> Result<Self, RouterError> {
        let id = id.into();
        let pattern = RoutePattern::from_json(pattern).map_err(|source| RouterError::Pattern {
            route: id.clone(),
            source,
        })?;
        let template =
            MessageTemplate::parse(template).map_err(|source| RouterError::Template {
                route: id.clone(),
                source,
            })?;
        Ok(Self::new(
            id,
            pattern,
            EventTransformer::template(template),
            destination,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn destination(&self) -> &Arc<dyn DurableQueue> {
        &self.destination
    }
}

impl std::fmt::Debug for RouteDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("id", &self.id)
            .field("pattern", &self.pattern.to_string())
            .field("destination", &self.destination.name())
            .finish()
    }
}

/// Running counters for one route.
#[derive(Debug, Default)]
pub struct RouteStats {
    matched: AtomicU64,
    delivered: AtomicU64,
    malformed: AtomicU64,
    escalated: AtomicU64,
}

/// Point-in-time copy of [`RouteStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStatsSnapshot {
    pub matched: u64,
    pub delivered: u64,
    pub malformed: u64,
    pub escalated: u64,
}

impl RouteStats {
    pub fn snapshot(&self) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            matched: self.matched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
        }
    }
}

/// Why a (route, event) pair was not delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteFailureKind {
    Malformed(String),
    DestinationUnavailable { attempts: u32, error: String },
}

/// A (route, event) pair that was not delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFailure {
    pub route: String,
    pub event: EventKey,
    pub kind: RouteFailureKind,
}

/// Outcome of routing one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteReport {
    pub events: usize,
    pub matched: usize,
    pub delivered: usize,
    pub failures: Vec<RouteFailure>,
}

impl RouteReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: RouteReport) {
        self.matched += other.matched;
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

struct Route {
    definition: RouteDefinition,
    stats: RouteStats,
}

/// A change-log batch handed to every route worker, numbered in read order.
type RouteBatch = (u64, Arc<[Arc<ChangeEvent>]>);

/// Holds back each checkpoint until every route has finished its batch.
struct CheckpointTracker {
    /// Last batch finished, per route.
    finished: Vec<u64>,
    /// Checkpoint after each batch read but not yet finished everywhere.
    pending: VecDeque<(u64, Checkpoint)>,
}

impl CheckpointTracker {
    fn new(routes: usize) -> Self {
        Self {
            finished: vec![0; routes],
            pending: VecDeque::new(),
        }
    }

    fn read(&mut self, seq: u64, checkpoint: Checkpoint, checkpoints: &watch::Sender<Checkpoint>) {
        self.pending.push_back((seq, checkpoint));
        self.publish(checkpoints);
    }

    fn finished(&mut self, route: usize, seq: u64, checkpoints: &watch::Sender<Checkpoint>) {
        if let Some(last) = self.finished.get_mut(route) {
            *last = (*last).max(seq);
        }
        self.publish(checkpoints);
    }

    /// Publish the newest checkpoint every route has caught up with.
    fn publish(&mut self, checkpoints: &watch::Sender<Checkpoint>) {
        let low = self.finished.iter().copied().min().unwrap_or(u64::MAX);
        let mut ready = None;
        while self.pending.front().is_some_and(|(seq, _)| *seq <= low) {
            ready = self.pending.pop_front().map(|(_, checkpoint)| checkpoint);
        }
        if let Some(checkpoint) = ready {
            checkpoints.send_replace(checkpoint);
        }
    }
}

/// Static route table over one change log.
pub struct FanoutRouter {
    routes: Vec<Route>,
    dead_letter: Arc<dyn DeadLetterPublisher>,
    enqueue_retries: usize,
}

/// Builder for [`FanoutRouter`]. Routes are fixed once built.
pub struct FanoutRouterBuilder {
    routes: Vec<RouteDefinition>,
    dead_letter: Arc<dyn DeadLetterPublisher>,
    enqueue_retries: usize,
}

impl Default for FanoutRouterBuilder {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            dead_letter: Arc::new(NoopDeadLetterPublisher),
            enqueue_retries: DEFAULT_ENQUEUE_RETRIES,
        }
    }
}

impl FanoutRouterBuilder {
    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    /// Target for malformed events and escalated enqueue failures.
    pub fn dead_letter(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letter = publisher;
        self
    }

    pub fn enqueue_retries(mut self, retries: usize) -> Self {
        self.enqueue_retries = retries;
        self
    }

    pub fn build(self) -> Result<FanoutRouter, RouterError> {
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.id.clone()) {
                return Err(RouterError::DuplicateRoute(route.id.clone()));
            }
        }
        if !self.dead_letter.is_configured() {
            warn!("Router has no dead letter target, failures will only be logged");
        }
        info!(
            routes = ?self.routes.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "Fan-out router built"
        );

        Ok(FanoutRouter {
            routes: self
                .routes
                .into_iter()
                .map(|definition| Route {
                    definition,
                    stats: RouteStats::default(),
                })
                .collect(),
            dead_letter: self.dead_letter,
            enqueue_retries: self.enqueue_retries,
        })
    }
}

impl FanoutRouter {
    pub fn builder() -> FanoutRouterBuilder {
        FanoutRouterBuilder::default()
    }

    /// Registered route ids, in registration order.
    pub fn route_ids(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.definition.id.as_str()).collect()
    }

    /// Counters for a route.
    pub fn stats(&self, route: &str) -> Option<RouteStatsSnapshot> {
        self.routes
            .iter()
            .find(|r| r.definition.id == route)
            .map(|r| r.stats.snapshot())
    }

    /// Route one batch of change events through every route.
    #[tracing::instrument(name = "router.route_batch", skip_all, fields(events = events.len()))]
    pub async fn route_batch(&self, events: &[Arc<ChangeEvent>]) -> RouteReport {
        let per_route = join_all(self.routes.iter().map(|route| self.route_events(route, events)));

        let mut report = RouteReport {
            events: events.len(),
            ..Default::default()
        };
        for route_report in per_route.await {
            report.merge(route_report);
        }

        if !report.is_clean() {
            warn!(
                failures = report.failures.len(),
                delivered = report.delivered,
                "Batch routed with failures"
            );
        }
        report
    }

    async fn route_events(&self, route: &Route, events: &[Arc<ChangeEvent>]) -> RouteReport {
        let id = route.definition.id.as_str();
        let mut report = RouteReport::default();

        for event in events {
            if !route.definition.pattern.matches(event) {
                continue;
            }
            report.matched += 1;
            route.stats.matched.fetch_add(1, Ordering::Relaxed);

            let message = match route.definition.transformer.transform(id, event) {
                Ok(message) => message,
                Err(e) => {
                    route.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(route = %id, event = %event.key(), error = %e, "Dropping malformed event for route");
                    let dead_letter =
                        DeadLetter::malformed(Arc::clone(event), id, &e.to_string(), COMPONENT);
                    self.publish_dead_letter(dead_letter).await;
                    report.failures.push(RouteFailure {
                        route: id.to_string(),
                        event: event.key(),
                        kind: RouteFailureKind::Malformed(e.to_string()),
                    });
                    continue;
                }
            };

            match self.deliver(route, message).await {
                Ok(()) => {
                    report.delivered += 1;
                    route.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err((attempts, e)) => report.failures.push(RouteFailure {
                    route: id.to_string(),
                    event: event.key(),
                    kind: RouteFailureKind::DestinationUnavailable {
                        attempts,
                        error: e.to_string(),
                    },
                }),
            }
        }
        report
    }

    /// Enqueue with bounded retries; escalate on exhaustion.
    async fn deliver(&self, route: &Route, message: OutboundMessage) -> Result<(), (u32, QueueError)> {
        let id = route.definition.id.as_str();
        let destination = &route.definition.destination;
        let mut attempts = 0u32;

        let result = (|| {
            attempts += 1;
            let message = message.clone();
            async move { destination.enqueue(message).await }
        })
        .retry(enqueue_backoff(self.enqueue_retries))
        .when(QueueError::is_transient)
        .notify(|err: &QueueError, dur: Duration| {
            warn!(route = %id, error = %err, delay = ?dur, "Enqueue failed, retrying");
        })
        .await;

        match result {
            Ok(message_id) => {
                debug!(route = %id, %message_id, "Message enqueued");
                Ok(())
            }
            Err(e) => {
                route.stats.escalated.fetch_add(1, Ordering::Relaxed);
                error!(
                    route = %id,
                    destination = %destination.name(),
                    source = %message.source,
                    attempts,
                    error = %e,
                    "Destination unavailable, escalating to dead letter"
                );
                let dead_letter = DeadLetter::destination_unavailable(
                    message,
                    attempts,
                    &e.to_string(),
                    COMPONENT,
                );
                self.publish_dead_letter(dead_letter).await;
                Err((attempts, e))
            }
        }
    }

    async fn publish_dead_letter(&self, dead_letter: DeadLetter) {
        let topic = dead_letter.topic();
        if let Err(e) = self.dead_letter.publish(dead_letter).await {
            error!(topic = %topic, error = %e, "Failed to publish dead letter");
        }
    }

    /// Pull batches from `stream` and route them until shutdown.
    ///
    /// Transient source errors are retried with backoff; anything else ends
    /// the loop with an error. Each route consumes the batches on its own
    /// worker. Once every route has finished a batch, the checkpoint after
    /// it is published on `checkpoints`. On shutdown the workers finish the
    /// batches already read before the loop returns.
    pub async fn run(
        &self,
        stream: Box<dyn ChangeStream>,
        poll_wait: Duration,
        shutdown: watch::Receiver<bool>,
        checkpoints: watch::Sender<Checkpoint>,
    ) -> Result<(), PipelineError> {
        info!(routes = self.routes.len(), "Router loop started");

        let progress = Mutex::new(CheckpointTracker::new(self.routes.len()));
        let mut senders = Vec::with_capacity(self.routes.len());
        let mut workers = Vec::with_capacity(self.routes.len());
        for (index, route) in self.routes.iter().enumerate() {
            // Batches share their events with the change log, so a backlog
            // behind a slow route holds pointers only.
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            workers.push(self.route_worker(index, route, rx, &progress, &checkpoints));
        }

        let reader = self.read_loop(stream, poll_wait, shutdown, senders, &progress, &checkpoints);
        let (result, _) = tokio::join!(reader, join_all(workers));

        info!("Router loop stopped");
        result
    }

    async fn read_loop(
        &self,
        mut stream: Box<dyn ChangeStream>,
        poll_wait: Duration,
        mut shutdown: watch::Receiver<bool>,
        senders: Vec<mpsc::UnboundedSender<RouteBatch>>,
        progress: &Mutex<CheckpointTracker>,
        checkpoints: &watch::Sender<Checkpoint>,
    ) -> Result<(), PipelineError> {
        let mut seq = 0u64;
        // Dropping `senders` on return lets the workers drain and stop.
        loop {
            match poll_batch(&mut stream, poll_wait, &mut shutdown).await {
                Ok(None) => return Ok(()),
                Ok(Some(events)) if events.is_empty() => {}
                Ok(Some(events)) => {
                    seq += 1;
                    progress.lock().unwrap_or_else(PoisonError::into_inner).read(
                        seq,
                        stream.checkpoint(),
                        checkpoints,
                    );
                    let events: Arc<[Arc<ChangeEvent>]> = Arc::from(events);
                    for sender in &senders {
                        // Receivers live until their sender is dropped.
                        let _ = sender.send((seq, Arc::clone(&events)));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Change log failed, stopping router");
                    return Err(e.into());
                }
            }
        }
    }

    async fn route_worker(
        &self,
        index: usize,
        route: &Route,
        mut batches: mpsc::UnboundedReceiver<RouteBatch>,
        progress: &Mutex<CheckpointTracker>,
        checkpoints: &watch::Sender<Checkpoint>,
    ) {
        let id = route.definition.id.as_str();
        while let Some((seq, events)) = batches.recv().await {
            let report = self.route_events(route, &events).await;
            if !report.is_clean() {
                warn!(
                    route = %id,
                    failures = report.failures.len(),
                    delivered = report.delivered,
                    "Batch routed with failures"
                );
            }
            progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finished(index, seq, checkpoints);
        }
        debug!(route = %id, "Route worker stopped");
    }

    /// Run the router loop on a background task.
    pub fn spawn(self: Arc<Self>, stream: Box<dyn ChangeStream>, poll_wait: Duration) -> RouterHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (checkpoint_tx, checkpoint_rx) = watch::channel(stream.checkpoint());
        let task =
            tokio::spawn(async move { self.run(stream, poll_wait, shutdown_rx, checkpoint_tx).await });
        RouterHandle {
            shutdown: shutdown_tx,
            checkpoints: checkpoint_rx,
            task,
        }
    }
}

/// Handle to a spawned router loop.
pub struct RouterHandle {
    shutdown: watch::Sender<bool>,
    checkpoints: watch::Receiver<Checkpoint>,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl RouterHandle {
    /// Checkpoint after the last routed batch.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoints.borrow().clone()
    }

    /// Subscribe to checkpoint updates.
    pub fn checkpoints(&self) -> watch::Receiver<Checkpoint> {
        self.checkpoints.clone()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) -> Result<(), PipelineError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
    }
}
