//! The canonical change envelope shared by every change source.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Field under which the document source stores the document key of an
/// update, next to the changed-field delta.
pub const DOCUMENT_KEY_FIELD: &str = "documentKey";

/// Ordered mapping from field name to value.
///
/// The shape depends on the notification's operation:
///
/// - `insert`: the full new record.
/// - `update`: the changed fields (document source: plus [`DOCUMENT_KEY_FIELD`]).
/// - `delete`: the identifying key fields only.
pub type Payload = Map<String, Value>;

/// Backing store that produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// PostgreSQL, captured through triggers and LISTEN/NOTIFY.
    Relational,
    /// MongoDB, captured through a change stream.
    Document,
}

impl Source {
    /// Lowercase name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Relational => "relational",
            Source::Document => "document",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A record was created.
    Insert,
    /// A record was modified.
    Update,
    /// A record was removed.
    Delete,
}

impl Operation {
    /// Map a store-native operation name onto the canonical enum.
    ///
    /// Matching ignores case, so the trigger's `TG_OP` spelling (`INSERT`)
    /// and the change stream's `operationType` (`insert`) both resolve.
    pub fn from_native(name: &str) -> Result<Self, Error> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("insert") {
            Ok(Operation::Insert)
        } else if name.eq_ignore_ascii_case("update") {
            Ok(Operation::Update)
        } else if name.eq_ignore_ascii_case("delete") {
            Ok(Operation::Delete)
        } else {
            Err(Error::UnknownOperation(name.to_string()))
        }
    }

    /// Lowercase name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row or document change, normalized across stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Store that produced the change.
    pub source: Source,
    /// Table or collection the change occurred on.
    pub collection: String,
    /// Normalized operation kind.
    pub operation: Operation,
    /// Change payload, see [`Payload`] for the per-operation shape.
    pub payload: Payload,
    /// Event time reported by the store, or capture time when it has none.
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    /// Create a notification stamped with the current time.
    pub fn new(
        source: Source,
        collection: impl Into<String>,
        operation: Operation,
        payload: Payload,
    ) -> Self {
        Self {
            source,
            collection: collection.into(),
            operation,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Replace the capture timestamp with the store's own event time.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Whether the payload carries the complete record image.
    ///
    /// Only inserts are guaranteed to; updates and deletes carry deltas and
    /// keys respectively.
    pub fn has_full_image(&self) -> bool {
        self.operation == Operation::Insert
    }

    /// Encode as the JSON frame delivered to subscribers.
    pub fn to_frame(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a JSON frame produced by [`Notification::to_frame`].
    pub fn from_frame(frame: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Convert an arbitrary JSON value into a payload, rejecting non-objects.
pub fn payload_from_value(value: Value) -> Result<Payload, Error> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(Error::InvalidPayload("null")),
        Value::Bool(_) => Err(Error::InvalidPayload("bool")),
        Value::Number(_) => Err(Error::InvalidPayload("number")),
        Value::String(_) => Err(Error::InvalidPayload("string")),
        Value::Array(_) => Err(Error::InvalidPayload("array")),
    }
}
