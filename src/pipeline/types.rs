//! Core data structures for the event processor
//!
//! - `EventEnvelope` / `InboundEvent`: in-flight bus events (never persisted)
//! - `SchemaPath`: one leaf field of a schema document
//! - `QueryRecord`: one durable query event row
//! - `FlatRow`: one aggregation result row keyed by comma-joined paths

use crate::bus::{BusMessage, Header};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Header carrying the event type (`Schema` or `Query`)
pub const TYPE_HEADER: &str = "type";

/// Header carrying the retry count of a requeued query event
pub const RETRY_COUNT_HEADER: &str = "retry_count";

/// Header carrying the earliest redelivery time (RFC 3339)
pub const NOT_BEFORE_HEADER: &str = "not_before";

/// Provenance placeholders until envelopes carry client metadata
pub const PLACEHOLDER_CLIENT: &str = "client_id";
pub const PLACEHOLDER_CLIENT_VERSION: &str = "v1";
pub const PLACEHOLDER_DATA_CENTER: &str = "Google";

/// Event type as read from the `type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Schema,
    Query,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Schema => "Schema",
            EventType::Query => "Query",
        }
    }

    /// Header values are matched exactly (`Schema`, `Query`)
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "Schema" => Some(EventType::Schema),
            "Query" => Some(EventType::Query),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-flight event with its retry bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub payload: String,
    pub retry_count: u32,
    /// Redelivery is not attempted before this instant
    pub not_before: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: impl Into<String>) -> Self {
        Self {
            event_type,
            payload: payload.into(),
            retry_count: 0,
            not_before: None,
        }
    }

    pub fn query(payload: impl Into<String>) -> Self {
        Self::new(EventType::Query, payload)
    }

    pub fn with_retry(mut self, retry_count: u32, not_before: Option<DateTime<Utc>>) -> Self {
        self.retry_count = retry_count;
        self.not_before = not_before;
        self
    }

    /// True once `not_before` (if any) has passed
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |nb| nb <= now)
    }

    /// Headers that let a consumer rebuild this envelope from a bus message
    pub fn headers(&self) -> Vec<Header> {
        let mut headers = vec![
            Header::new(TYPE_HEADER, self.event_type.as_str()),
            Header::new(RETRY_COUNT_HEADER, self.retry_count.to_string()),
        ];
        if let Some(nb) = self.not_before {
            headers.push(Header::new(
                NOT_BEFORE_HEADER,
                nb.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ));
        }
        headers
    }
}

/// Why an inbound message could not be typed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnrecognizedReason {
    #[error("event type not found in the event")]
    MissingTypeHeader,

    #[error("invalid event type received: {0}")]
    UnknownType(String),
}

/// An inbound message decoded once at the ingestion boundary
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Schema(EventEnvelope),
    Query(EventEnvelope),
    Unrecognized(UnrecognizedReason),
}

impl InboundEvent {
    /// Decode the type header (plus retry headers, if present) of a bus message
    pub fn decode(message: &BusMessage) -> Self {
        let event_type = match message.header(TYPE_HEADER) {
            None => return InboundEvent::Unrecognized(UnrecognizedReason::MissingTypeHeader),
            Some(value) => match EventType::from_header(value) {
                Some(t) => t,
                None => {
                    return InboundEvent::Unrecognized(UnrecognizedReason::UnknownType(
                        value.to_string(),
                    ))
                }
            },
        };

        let retry_count = message
            .header(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        let not_before = message
            .header(NOT_BEFORE_HEADER)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let envelope = EventEnvelope::new(event_type, message.payload.clone())
            .with_retry(retry_count, not_before);

        match event_type {
            EventType::Schema => InboundEvent::Schema(envelope),
            EventType::Query => InboundEvent::Query(envelope),
        }
    }
}

/// One leaf field of a schema document, e.g. `deal,title`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaPath(String);

impl SchemaPath {
    pub const SEPARATOR: char = ',';

    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(Self::SEPARATOR)
    }

    /// Extend the path by one (already lowercased) segment
    pub fn child(parent: Option<&SchemaPath>, segment: &str) -> Self {
        match parent {
            Some(p) => Self(format!("{}{}{}", p.0, Self::SEPARATOR, segment)),
            None => Self(segment.to_string()),
        }
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Durable query event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub client: String,
    pub client_version: String,
    pub data_center: String,
    pub processed_time: DateTime<Utc>,
    pub query: String,
}

impl QueryRecord {
    /// Build a record with the provenance placeholders
    pub fn new(query: impl Into<String>, processed_time: DateTime<Utc>) -> Self {
        Self {
            client: PLACEHOLDER_CLIENT.to_string(),
            client_version: PLACEHOLDER_CLIENT_VERSION.to_string(),
            data_center: PLACEHOLDER_DATA_CENTER.to_string(),
            processed_time,
            query: query.into(),
        }
    }
}

/// One flat aggregation row: comma-joined path (or dimension) -> value
pub type FlatRow = serde_json::Map<String, serde_json::Value>;
