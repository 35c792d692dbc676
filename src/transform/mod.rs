//! Event transformers.
//!
//! Maps a change event that passed a route's filter to the route's outbound
//! message shape. Transforms are pure; the set of transforms is a closed
//! tagged enum rather than a plugin system, since routes are fixed when the
//! router is built.

use std::fmt;

use serde_json::Value;

use crate::event::{AttributePath, ChangeEvent, EventKey};
use crate::message::{OutboundMessage, TraceContext};

pub mod template;

pub use template::{MessageTemplate, TemplateError};

/// Default attribute carrying the W3C `traceparent` of the writer.
pub const DEFAULT_TRACE_PARENT_ATTR: &str = "TraceParent";
/// Default attribute carrying the writer's span id.
pub const DEFAULT_PARENT_SPAN_ATTR: &str = "ParentSpan";

/// A route's transform could not produce a message for an event.
///
/// The router drops the event for that route only, counts it and
/// dead-letters it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedEventError {
    #[error("Event {key} is missing required field '{path}'")]
    MissingField { key: EventKey, path: String },

    #[error("Event {key} produced an invalid message: {message}")]
    InvalidMessage { key: EventKey, message: String },
}

impl MalformedEventError {
    /// Key of the offending event.
    pub fn key(&self) -> &EventKey {
        match self {
            MalformedEventError::MissingField { key, .. }
            | MalformedEventError::InvalidMessage { key, .. } => key,
        }
    }
}

/// Hand-written transform.
pub type TransformFn = fn(&ChangeEvent) -> Result<Value, MalformedEventError>;

/// How a route shapes its message body.
#[derive(Clone)]
pub enum Transform {
    /// Render a JSON template with attribute placeholders.
    Template(MessageTemplate),
    /// Forward the whole row image as plain JSON.
    Passthrough,
    /// Custom function.
    Function(TransformFn),
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Template(t) => f.debug_tuple("Template").field(&t.to_string()).finish(),
            Transform::Passthrough => f.write_str("Passthrough"),
            Transform::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl Transform {
    fn body(&self, event: &ChangeEvent) -> Result<Value, MalformedEventError> {
        match self {
            Transform::Template(template) => template.render(event),
            Transform::Passthrough => Ok(event.to_json()),
            Transform::Function(f) => f(event),
        }
    }
}

/// Attributes the trace context is copied from.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFields {
    pub trace_parent: AttributePath,
    pub parent_span: AttributePath,
}

impl Default for TraceFields {
    fn default() -> Self {
        Self {
            trace_parent: AttributePath::field(DEFAULT_TRACE_PARENT_ATTR),
            parent_span: AttributePath::field(DEFAULT_PARENT_SPAN_ATTR),
        }
    }
}

impl TraceFields {
    fn extract(&self, event: &ChangeEvent) -> TraceContext {
        let read = |path: &AttributePath| {
            event
                .resolve(path)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        TraceContext {
            trace_parent: read(&self.trace_parent),
            parent_span: read(&self.parent_span),
        }
    }
}

/// Transform plus trace propagation for one route.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    transform: Transform,
    trace_fields: TraceFields,
}

impl EventTransformer {
    pub fn new(transform: Transform) -> Self {
        Self {
            transform,
            trace_fields: TraceFields::default(),
        }
    }

    /// Template transform.
    pub fn template(template: MessageTemplate) -> Self {
        Self::new(Transform::Template(template))
    }

    /// Whole-image transform.
    pub fn passthrough() -> Self {
        Self::new(Transform::Passthrough)
    }

    /// Function transform.
    pub fn function(f: TransformFn) -> Self {
        Self::new(Transform::Function(f))
    }

    /// Read trace context from different attributes.
    pub fn with_trace_fields(mut self, trace_fields: TraceFields) -> Self {
        self.trace_fields = trace_fields;
        self
    }

    /// Produce the outbound message for `event` on `route`.
    pub fn transform(
        &self,
        route: &str,
        event: &ChangeEvent,
    ) -> Result<OutboundMessage, MalformedEventError> {
        let body = self.transform.body(event)?;
        let trace = self.trace_fields.extract(event);
        Ok(OutboundMessage::new(route, event.key(), body, trace))
    }
}
