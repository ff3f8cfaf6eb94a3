//! Row deserialization seams
//!
//! Two pluggable decoders sit between the parser worker and delivery:
//!
//! - [`StreamDeserializer`] splits blob-carrying frames into typed rows
//!   with symbol tags (heterogeneous streams multiplexed into one table).
//! - [`EventResolver`] decodes event-subscription payloads into
//!   `(event_type, attributes)` tuples against registered schemas.

use std::collections::HashMap;

use rill_protocol::{Value, Vector};
use thiserror::Error;

/// Errors raised by the deserialization seams
#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error("payload is not an any-vector of columns")]
    NotColumnar,

    #[error("missing blob column")]
    MissingBlob,

    #[error("unknown event type `{0}`")]
    UnknownEventType(String),

    #[error("event type cell is not a string")]
    BadEventTypeCell,

    #[error("event `{event_type}` expects {expected} attributes, got {actual}")]
    AttributeCountMismatch {
        event_type: String,
        expected: usize,
        actual: usize,
    },

    #[error("{0}")]
    Other(String),
}

/// Splits an incoming blob vector into typed rows with symbol tags.
///
/// Implementations own the schema knowledge for the blob encoding; the
/// engine only needs rows back, one per incoming row, in order, each tagged
/// with the symbol naming its originating stream.
pub trait StreamDeserializer: Send + Sync {
    fn parse_blob(&self, data: &Vector) -> Result<(Vec<Vector>, Vec<String>), DeserializeError>;
}

// =============================================================================
// Event schema resolution
// =============================================================================

/// Shape of one event kind on an event stream
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub event_type: String,
    pub attr_names: Vec<String>,
}

impl EventSchema {
    pub fn new<I, S>(event_type: impl Into<String>, attr_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_type: event_type.into(),
            attr_names: attr_names.into_iter().map(Into::into).collect(),
        }
    }
}

/// Decodes event-subscription payloads.
///
/// An event frame is an any-vector of columns where the first column names
/// the event type of each row and the remaining columns carry the
/// attributes in schema order.
pub struct EventResolver {
    schemas: HashMap<String, EventSchema>,
}

impl EventResolver {
    pub fn new(schemas: impl IntoIterator<Item = EventSchema>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|s| (s.event_type.clone(), s))
                .collect(),
        }
    }

    /// Whether any schema is registered for `event_type`
    pub fn knows(&self, event_type: &str) -> bool {
        self.schemas.contains_key(event_type)
    }

    /// Decode a raw event payload into `(event_type, attributes)` tuples,
    /// one per row.
    pub fn decode(&self, data: &Vector) -> Result<Vec<(String, Vec<Value>)>, DeserializeError> {
        if data.values.is_empty() {
            return Err(DeserializeError::NotColumnar);
        }
        data.check_columns()
            .map_err(|_| DeserializeError::NotColumnar)?;

        let rows = data.row_count();
        let mut out = Vec::with_capacity(rows);
        let split = data.split_rows();

        for row in &split {
            let event_type = match row.values.first() {
                Some(Value::String(s)) | Some(Value::Symbol(s)) => s.clone(),
                Some(_) => return Err(DeserializeError::BadEventTypeCell),
                None => return Err(DeserializeError::NotColumnar),
            };
            let schema = self
                .schemas
                .get(&event_type)
                .ok_or_else(|| DeserializeError::UnknownEventType(event_type.clone()))?;

            let attrs: Vec<Value> = row.values[1..].to_vec();
            if attrs.len() != schema.attr_names.len() {
                return Err(DeserializeError::AttributeCountMismatch {
                    event_type,
                    expected: schema.attr_names.len(),
                    actual: attrs.len(),
                });
            }
            out.push((event_type, attrs));
        }
        Ok(out)
    }
}
