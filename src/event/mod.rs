//! Change events emitted by the table's change log.
//!
//! A [`ChangeEvent`] is one committed row mutation. Events are immutable once
//! emitted and are shared between readers as `Arc<ChangeEvent>`.
//!
//! Attribute values use the same typed shape as the backing table's stream
//! images (`{"S": "..."}`, `{"N": "42"}`, nested `{"M": {...}}`), so events
//! serialize to the JSON a stream consumer would see.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute map of a row image.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// String.
    S(String),
    /// Number, kept in its textual form like the table does.
    N(String),
    /// Boolean.
    #[serde(rename = "BOOL")]
    Bool(bool),
    /// Explicit null.
    #[serde(rename = "NULL")]
    Null,
    /// Nested map.
    M(Attributes),
    /// List.
    L(Vec<AttributeValue>),
}

impl AttributeValue {
    /// String value, if this is an `S`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, if this is an `N` that parses.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    /// Plain JSON rendering (type tags dropped).
    ///
    /// Numbers that do not parse as JSON numbers are rendered as strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            AttributeValue::S(s) => Value::String(s.clone()),
            AttributeValue::N(n) => {
                serde_json::from_str::<serde_json::Number>(n)
                    .map(Value::Number)
                    .unwrap_or_else(|_| Value::String(n.clone()))
            }
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Null => Value::Null,
            AttributeValue::M(m) => Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            AttributeValue::L(l) => Value::Array(l.iter().map(|v| v.to_json()).collect()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::S(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::S(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::N(value.to_string())
    }
}

impl From<Attributes> for AttributeValue {
    fn from(value: Attributes) -> Self {
        AttributeValue::M(value)
    }
}

const ENVELOPE_ROOT: &str = "dynamodb";
const ENVELOPE_IMAGE: &str = "NewImage";
const TYPE_TAGS: [&str; 6] = ["S", "N", "BOOL", "NULL", "M", "L"];

/// Dotted path into an event's attributes, e.g. `Address.City`.
///
/// Each segment after the first descends into a nested `M` value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributePath {
    segments: Vec<String>,
}

/// Error parsing an attribute path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid attribute path '{0}'")]
pub struct InvalidPath(pub String);

impl AttributePath {
    /// Parse a dotted path. A leading `$.` is accepted and ignored.
    ///
    /// Paths written against the stream record envelope
    /// (`dynamodb.NewImage.EmailAddress.S`) are normalized to the attribute
    /// path (`EmailAddress`).
    pub fn parse(path: &str) -> Result<Self, InvalidPath> {
        let trimmed = path.trim();
        let body = trimmed.strip_prefix("$.").unwrap_or(trimmed);
        if body.is_empty() {
            return Err(InvalidPath(path.to_string()));
        }

        let mut segments: Vec<String> = body.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(InvalidPath(path.to_string()));
        }

        if segments.len() > 2 && segments[0] == ENVELOPE_ROOT && segments[1] == ENVELOPE_IMAGE {
            segments.drain(..2);
            if segments.len() > 1
                && segments
                    .last()
                    .is_some_and(|s| TYPE_TAGS.contains(&s.as_str()))
            {
                segments.pop();
            }
        }

        Ok(Self { segments })
    }

    /// Path to a top-level attribute.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolve this path against an attribute map.
    ///
    /// Touches only the referenced segments. Any missing segment, or a
    /// non-map value in the middle of the path, resolves to `None`.
    pub fn resolve<'a>(&self, attributes: &'a Attributes) -> Option<&'a AttributeValue> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = attributes.get(first)?;
        for segment in rest {
            match current {
                AttributeValue::M(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for AttributePath {
    type Err = InvalidPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AttributePath {
    type Error = InvalidPath;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AttributePath> for String {
    fn from(value: AttributePath) -> Self {
        value.to_string()
    }
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Modify,
    Remove,
}

impl EventType {
    /// Stream name of the event type (`INSERT`, `MODIFY`, `REMOVE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Modify => "MODIFY",
            EventType::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(EventType::Insert),
            "MODIFY" => Ok(EventType::Modify),
            "REMOVE" => Ok(EventType::Remove),
            other => Err(format!("Unknown event type '{}'", other)),
        }
    }
}

/// Identity of a change event, used for consumer idempotence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub partition_key: String,
    pub sequence_number: u64,
}

impl EventKey {
    pub fn new(partition_key: impl Into<String>, sequence_number: u64) -> Self {
        Self {
            partition_key: partition_key.into(),
            sequence_number,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.partition_key, self.sequence_number)
    }
}

/// One committed row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    partition_key: String,
    sequence_number: u64,
    event_type: EventType,
    attributes: Attributes,
    approximate_arrival_time: DateTime<Utc>,
}

impl ChangeEvent {
    /// Build an event. Normally only the change log does this.
    pub fn new(
        partition_key: impl Into<String>,
        sequence_number: u64,
        event_type: EventType,
        attributes: Attributes,
        approximate_arrival_time: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            sequence_number,
            event_type,
            attributes,
            approximate_arrival_time,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn approximate_arrival_time(&self) -> DateTime<Utc> {
        self.approximate_arrival_time
    }

    /// Idempotence key `(partition_key, sequence_number)`.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.partition_key.clone(), self.sequence_number)
    }

    /// Resolve a dotted attribute path.
    pub fn resolve(&self, path: &AttributePath) -> Option<&AttributeValue> {
        path.resolve(&self.attributes)
    }

    /// Top-level string attribute.
    pub fn string_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::as_str)
    }

    /// Row image as plain JSON (type tags dropped).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Build an [`Attributes`] map from `(name, value)` pairs.
pub fn attributes<K, V, I>(pairs: I) -> Attributes
where
    K: Into<String>,
    V: Into<AttributeValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
