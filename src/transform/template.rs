//! Output message templates.
//!
//! A template is JSON text with placeholders referencing event attributes:
//!
//! ```text
//! {
//!   "email_address": <$.EmailAddress>,
//!   "trace_parent": <$.TraceParent?>
//! }
//! ```
//!
//! `<$.Path>` is required; `<$.Path?>` renders `null` when the path is
//! absent. Placeholders are replaced by the JSON rendering of the resolved
//! value, so they appear unquoted in the template.

use std::fmt;

use serde_json::Value;

use super::MalformedEventError;
use crate::event::{AttributePath, ChangeEvent, InvalidPath};

/// Errors parsing a template.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Unterminated placeholder at offset {0}")]
    Unterminated(usize),

    #[error(transparent)]
    Path(#[from] InvalidPath),

    #[error("Placeholder at offset {0} is inside a string literal")]
    QuotedPlaceholder(usize),

    #[error("Template does not render to valid JSON: {0}")]
    InvalidJson(String),
}

/// Tracks whether scanned JSON text ends inside a string literal.
#[derive(Default)]
struct QuoteState {
    in_string: bool,
    escaped: bool,
}

impl QuoteState {
    fn scan(&mut self, text: &str) {
        for c in text.chars() {
            if self.escaped {
                self.escaped = false;
            } else if self.in_string && c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = !self.in_string;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Field { path: AttributePath, optional: bool },
}

/// Parsed message template.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl MessageTemplate {
    /// Parse and validate a template.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = template;
        let mut offset = 0;
        let mut quotes = QuoteState::default();

        while let Some(start) = rest.find("<$") {
            quotes.scan(&rest[..start]);
            if quotes.in_string {
                return Err(TemplateError::QuotedPlaceholder(offset + start));
            }
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 1..];
            let end = after
                .find('>')
                .ok_or(TemplateError::Unterminated(offset + start))?;

            let raw = after[..end].trim();
            let (raw, optional) = match raw.strip_suffix('?') {
                Some(stripped) => (stripped, true),
                None => (raw, false),
            };
            segments.push(Segment::Field {
                path: AttributePath::parse(raw)?,
                optional,
            });

            let consumed = start + 1 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        let parsed = Self {
            source: template.to_string(),
            segments,
        };

        // Placeholders sit outside string literals and each renders to one
        // JSON value, so a null-filled rendering is valid exactly when every
        // real rendering is.
        let probe = parsed.assemble(|_, _| Ok::<_, TemplateError>("null".to_string()))?;
        serde_json::from_str::<Value>(&probe)
            .map_err(|e| TemplateError::InvalidJson(e.to_string()))?;

        Ok(parsed)
    }

    /// Paths referenced by the template.
    pub fn paths(&self) -> impl Iterator<Item = &AttributePath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field { path, .. } => Some(path),
            Segment::Text(_) => None,
        })
    }

    /// Paths that must be present for rendering to succeed.
    pub fn required_paths(&self) -> impl Iterator<Item = &AttributePath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field {
                path,
                optional: false,
            } => Some(path),
            _ => None,
        })
    }

    /// Render the template for an event.
    pub fn render(&self, event: &ChangeEvent) -> Result<Value, MalformedEventError> {
        let text = self.assemble(|path, optional| match event.resolve(path) {
            Some(value) => Ok(value.to_json().to_string()),
            None if optional => Ok("null".to_string()),
            None => Err(MalformedEventError::MissingField {
                key: event.key(),
                path: path.to_string(),
            }),
        })?;

        serde_json::from_str(&text).map_err(|e| MalformedEventError::InvalidMessage {
            key: event.key(),
            message: e.to_string(),
        })
    }

    fn assemble<E>(
        &self,
        mut field: impl FnMut(&AttributePath, bool) -> Result<String, E>,
    ) -> Result<String, E> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field { path, optional } => out.push_str(&field(path, *optional)?),
            }
        }
        Ok(out)
    }
}

impl fmt::Display for MessageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for MessageTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
