//! Direct change-log consumption.
//!
//! Lower-latency path that hands change-log batches straight to a handler,
//! skipping the fan-out queues. A failed batch is retried with backoff up to
//! `max_attempts`; after that it is dead-lettered and the stream moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::HandlerError;
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::error::PipelineError;
use crate::event::ChangeEvent;
use crate::source::{poll_batch, ChangeStream};
use crate::utils::retry::stream_batch_backoff;

/// Default attempts per batch, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Business logic invoked with raw change-log batches.
#[async_trait]
pub trait EventBatchHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, events: &[Arc<ChangeEvent>]) -> Result<(), HandlerError>;
}

/// Result of processing one change-log batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Empty,
    Processed { attempts: u32 },
    DeadLettered { attempts: u32 },
}

pub struct StreamInvoker {
    handler: Arc<dyn EventBatchHandler>,
    dead_letter: Arc<dyn DeadLetterPublisher>,
    max_attempts: u32,
}

impl StreamInvoker {
    pub fn new(handler: Arc<dyn EventBatchHandler>, dead_letter: Arc<dyn DeadLetterPublisher>) -> Self {
        Self {
            handler,
            dead_letter,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Process one batch, retrying then dead-lettering on failure.
    #[tracing::instrument(name = "invoker.stream_batch", skip_all, fields(handler = %self.handler.name(), size = events.len()))]
    pub async fn process(&self, events: Vec<Arc<ChangeEvent>>) -> StreamOutcome {
        if events.is_empty() {
            return StreamOutcome::Empty;
        }

        let handler = &self.handler;
        let batch = &events;
        let mut attempts = 0u32;
        let result = (|| {
            attempts += 1;
            async move { handler.handle(batch).await }
        })
        .retry(stream_batch_backoff((self.max_attempts - 1) as usize))
        .notify(|err: &HandlerError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Stream batch failed, retrying");
        })
        .await;

        match result {
            Ok(()) => StreamOutcome::Processed { attempts },
            Err(e) => {
                error!(attempts, error = %e, "Stream batch failed, dead-lettering");
                let component = format!("stream:{}", self.handler.name());
                let dead_letter =
                    DeadLetter::stream_batch_failed(events, attempts, &e.to_string(), &component);
                if let Err(e) = self.dead_letter.publish(dead_letter).await {
                    error!(error = %e, "Failed to publish dead letter");
                }
                StreamOutcome::DeadLettered { attempts }
            }
        }
    }

    /// Consume `stream` until shutdown.
    pub async fn run(
        &self,
        mut stream: Box<dyn ChangeStream>,
        poll_wait: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        info!(handler = %self.handler.name(), "Stream invoker started");
        while let Some(events) = poll_batch(&mut stream, poll_wait, &mut shutdown).await? {
            self.process(events).await;
        }
        info!(handler = %self.handler.name(), "Stream invoker stopped");
        Ok(())
    }

    /// Run the consumer loop on a background task.
    pub fn spawn(self: Arc<Self>, stream: Box<dyn ChangeStream>, poll_wait: Duration) -> StreamHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(stream, poll_wait, shutdown_rx).await });
        StreamHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a spawned stream invoker.
pub struct StreamHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl StreamHandle {
    pub async fn stop(self) -> Result<(), PipelineError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
    }
}
