use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::api::GatewayError;

const MESSAGE_ID: &str = "messageId";
const ANONYMOUS_ID: &str = "anonymousId";
const TYPE: &str = "type";
const BATCH: &str = "batch";

/// The seven handler kinds exposed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alias,
    Batch,
    Group,
    Identify,
    Page,
    Screen,
    Track,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Alias,
        EventKind::Batch,
        EventKind::Group,
        EventKind::Identify,
        EventKind::Page,
        EventKind::Screen,
        EventKind::Track,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alias => "alias",
            EventKind::Batch => "batch",
            EventKind::Group => "group",
            EventKind::Identify => "identify",
            EventKind::Page => "page",
            EventKind::Screen => "screen",
            EventKind::Track => "track",
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, EventKind::Batch)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type EventRecord = Map<String, Value>;

/// A parsed request body, before identifiers are injected.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRequest {
    /// The whole body is one event
    Single(EventRecord),
    /// The body's `batch` array, one event per element
    Batch(Vec<EventRecord>),
}

impl RawRequest {
    /// Parses a body according to the extraction strategy of `kind`. Anything that is not
    /// well-formed JSON of the expected shape is `InvalidJson`.
    pub fn parse(kind: EventKind, body: &[u8]) -> Result<RawRequest, GatewayError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            tracing::debug!("failed to parse body: {}", e);
            GatewayError::InvalidJson
        })?;

        let Value::Object(mut object) = value else {
            return Err(GatewayError::InvalidJson);
        };

        if !kind.is_batch() {
            return Ok(RawRequest::Single(object));
        }

        let Some(Value::Array(elements)) = object.remove(BATCH) else {
            return Err(GatewayError::InvalidJson);
        };
        if elements.is_empty() {
            return Err(GatewayError::InvalidJson);
        }

        elements
            .into_iter()
            .map(|element| match element {
                Value::Object(record) => Ok(record),
                _ => Err(GatewayError::InvalidJson),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(RawRequest::Batch)
    }

    pub fn len(&self) -> usize {
        match self {
            RawRequest::Single(_) => 1,
            RawRequest::Batch(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The request's records, single kinds stamped with their `type`.
    pub fn into_records(self, kind: EventKind) -> Vec<EventRecord> {
        match self {
            RawRequest::Single(mut record) => {
                record.insert(TYPE.to_string(), Value::String(kind.as_str().to_string()));
                vec![record]
            }
            RawRequest::Batch(records) => records,
        }
    }
}

/// Request-level data stamped onto the envelope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub write_key: String,
    pub request_ip: String,
    pub received_at: String,
}

/// The unit handed to the job store: every event of one HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "receivedAt")]
    pub received_at: String,
    #[serde(rename = "writeKey")]
    pub write_key: String,
    #[serde(rename = "requestIP")]
    pub request_ip: String,
    pub batch: Vec<EventRecord>,
}

impl EventEnvelope {
    /// Envelope without records, dispatched for rejected requests.
    pub fn empty(context: &RequestContext) -> Self {
        Self {
            received_at: context.received_at.clone(),
            write_key: context.write_key.clone(),
            request_ip: context.request_ip.clone(),
            batch: Vec::new(),
        }
    }

    pub fn normalize(kind: EventKind, request: RawRequest, context: &RequestContext) -> Self {
        Self::from_records(request.into_records(kind), context)
    }

    /// Wraps already extracted records, injecting identifiers into each of them.
    pub fn from_records(records: Vec<EventRecord>, context: &RequestContext) -> Self {
        let batch = records
            .into_iter()
            .map(|mut record| {
                ensure_identifier(&mut record, MESSAGE_ID);
                ensure_identifier(&mut record, ANONYMOUS_ID);
                record
            })
            .collect();

        Self {
            batch,
            ..Self::empty(context)
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// The `messageId` as sent by the caller, in textual form. Blank ids are not ids.
pub fn caller_message_id(record: &EventRecord) -> Option<String> {
    match record.get(MESSAGE_ID)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Guarantees `record[field]` holds a UUID string. UUIDs are kept, blanks get a random
/// one, anything else is mapped to a stable name-based UUID.
fn ensure_identifier(record: &mut EventRecord, field: &str) {
    let replacement = match record.get(field) {
        None | Some(Value::Null) => Uuid::new_v4(),
        Some(Value::String(s)) if s.is_empty() => Uuid::new_v4(),
        Some(Value::String(s)) => match Uuid::parse_str(s) {
            Ok(_) => return,
            Err(_) => Uuid::new_v5(&Uuid::NAMESPACE_OID, s.as_bytes()),
        },
        Some(other) => Uuid::new_v5(&Uuid::NAMESPACE_OID, other.to_string().as_bytes()),
    };
    record.insert(field.to_string(), Value::String(replacement.to_string()));
}
