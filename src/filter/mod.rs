//! Route filter patterns.
//!
//! A [`RoutePattern`] maps attribute paths to sets of literal values. An event
//! matches when every listed path resolves to one of its literals, and its
//! event type is accepted when the pattern constrains it. Absent paths never
//! match.
//!
//! Patterns are usually declared as JSON:
//!
//! ```json
//! {"Type": ["SubscriberToken"], "eventName": ["INSERT", "MODIFY"]}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;

use crate::event::{AttributePath, AttributeValue, ChangeEvent, EventType, InvalidPath};

/// Pattern key that constrains the event type instead of an attribute.
pub const EVENT_NAME_KEY: &str = "eventName";

/// Errors building a pattern.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("Pattern is not valid JSON: {0}")]
    Json(String),

    #[error("Pattern must be a JSON object")]
    NotAnObject,

    #[error("Pattern must constrain at least one field")]
    Empty,

    #[error("Values for '{0}' must be a non-empty array")]
    ExpectedArray(String),

    #[error("Unsupported literal for '{field}': {value}")]
    UnsupportedLiteral { field: String, value: String },

    #[error(transparent)]
    Path(#[from] InvalidPath),

    #[error("Unknown event type '{0}'")]
    EventType(String),
}

/// A literal a pattern compares attribute values against.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl Literal {
    /// Whether an attribute value equals this literal.
    ///
    /// Numbers compare numerically, so `N("5.0")` equals `Number(5.0)`.
    pub fn accepts(&self, value: &AttributeValue) -> bool {
        match (self, value) {
            (Literal::String(expected), AttributeValue::S(actual)) => expected == actual,
            (Literal::Number(expected), AttributeValue::N(_)) => {
                value.as_f64().is_some_and(|actual| actual == *expected)
            }
            (Literal::Bool(expected), AttributeValue::Bool(actual)) => expected == actual,
            (Literal::Null, AttributeValue::Null) => true,
            _ => false,
        }
    }

    fn from_json(field: &str, value: &Value) -> Result<Self, PatternError> {
        match value {
            Value::String(s) => Ok(Literal::String(s.clone())),
            Value::Number(n) => n.as_f64().map(Literal::Number).ok_or_else(|| {
                PatternError::UnsupportedLiteral {
                    field: field.to_string(),
                    value: n.to_string(),
                }
            }),
            Value::Bool(b) => Ok(Literal::Bool(*b)),
            Value::Null => Ok(Literal::Null),
            other => Err(PatternError::UnsupportedLiteral {
                field: field.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::String(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::String(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Number(value)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Null => f.write_str("null"),
        }
    }
}

/// Declarative "attribute X equals one of {literals}" predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutePattern {
    fields: BTreeMap<AttributePath, Vec<Literal>>,
    event_types: Option<BTreeSet<EventType>>,
}

impl RoutePattern {
    /// Empty pattern. Matches every event until constrained.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `path` to equal one of `values`.
    pub fn with_field<I, L>(mut self, path: &str, values: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = L>,
        L: Into<Literal>,
    {
        let path = AttributePath::parse(path)?;
        let literals: Vec<Literal> = values.into_iter().map(Into::into).collect();
        if literals.is_empty() {
            return Err(PatternError::ExpectedArray(path.to_string()));
        }
        self.fields.entry(path).or_default().extend(literals);
        Ok(self)
    }

    /// Only accept the given event types.
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types
            .get_or_insert_with(BTreeSet::new)
            .extend(types);
        self
    }

    /// Parse a JSON pattern.
    pub fn from_json(json: &str) -> Result<Self, PatternError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| PatternError::Json(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Build a pattern from an already-parsed JSON value.
    pub fn from_value(value: &Value) -> Result<Self, PatternError> {
        let object = value.as_object().ok_or(PatternError::NotAnObject)?;
        if object.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut pattern = Self::new();
        for (field, values) in object {
            let values = values
                .as_array()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| PatternError::ExpectedArray(field.clone()))?;

            if field == EVENT_NAME_KEY {
                let types = values
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .and_then(|s| s.parse::<EventType>().ok())
                            .ok_or_else(|| PatternError::EventType(v.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                pattern = pattern.with_event_types(types);
                continue;
            }

            let literals = values
                .iter()
                .map(|v| Literal::from_json(field, v))
                .collect::<Result<Vec<_>, _>>()?;
            pattern = pattern.with_field(field, literals)?;
        }

        Ok(pattern)
    }

    /// Evaluate the pattern against an event. Pure.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        matches(event, self)
    }

    /// Constrained attribute paths.
    pub fn paths(&self) -> impl Iterator<Item = &AttributePath> {
        self.fields.keys()
    }

    /// Number of constraints (attribute paths plus event-type constraint).
    pub fn len(&self) -> usize {
        self.fields.len() + usize::from(self.event_types.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|(path, literals)| {
                let values: Vec<String> = literals.iter().map(ToString::to_string).collect();
                format!("{} in [{}]", path, values.join(", "))
            })
            .collect();
        if let Some(types) = &self.event_types {
            let names: Vec<&str> = types.iter().map(EventType::as_str).collect();
            parts.push(format!("{} in [{}]", EVENT_NAME_KEY, names.join(", ")));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Whether `event` satisfies `pattern`.
///
/// Deterministic and side-effect free. Only the referenced paths of the
/// event are visited.
pub fn matches(event: &ChangeEvent, pattern: &RoutePattern) -> bool {
    if let Some(types) = &pattern.event_types {
        if !types.contains(&event.event_type()) {
            return false;
        }
    }

    pattern.fields.iter().all(|(path, literals)| {
        event
            .resolve(path)
            .is_some_and(|value| literals.iter().any(|l| l.accepts(value)))
    })
}
