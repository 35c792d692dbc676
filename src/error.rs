//! Pipeline-level error aggregation.

use crate::config::ConfigError;
use crate::dlq::DlqError;
use crate::filter::PatternError;
use crate::invoker::HandlerError;
use crate::queue::QueueError;
use crate::router::RouterError;
use crate::source::SourceError;
use crate::transform::TemplateError;

/// Any error surfaced by the fan-out pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Change log error: {0}")]
    Source(#[from] SourceError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("Invalid template: {0}")]
    Template(#[from] TemplateError),

    #[error("Dead letter error: {0}")]
    DeadLetter(#[from] DlqError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
