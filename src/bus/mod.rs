//! Message bus seam
//!
//! The pipeline talks to the bus only through these traits:
//! - `BusConsumer` - blocking read + explicit commit (at-least-once)
//! - `BusProducer` - publish to a named topic (retry / dead-letter)
//! - `BusAdmin` - idempotent topic provisioning
//!
//! Implementations:
//! - `nats::NatsBus` - NATS JetStream (production runtime)
//! - `memory::MemoryBus` - in-process logs (tests and offline runs)

pub mod demo_producer;
pub mod memory;
pub mod nats;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBus;
pub use nats::{NatsBus, NatsConsumer};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("error while reading the message from topic {topic}: {reason}")]
    Read { topic: String, reason: String },

    #[error("error while committing the message in topic {topic}, offset {offset}: {reason}")]
    Commit {
        topic: String,
        offset: u64,
        reason: String,
    },

    #[error("not able to write the message to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("topic not found: {0}")]
    UnknownTopic(String),

    #[error("failed to provision topic {topic}: {reason}")]
    Provision { topic: String, reason: String },

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
}

/// Key/value metadata attached to a bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message as delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub offset: u64,
    pub key: String,
    pub headers: Vec<Header>,
    pub payload: String,
}

impl BusMessage {
    /// First header with the given key
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }
}

/// A message handed to a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: String,
    pub headers: Vec<Header>,
    pub payload: String,
}

impl OutboundMessage {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            headers: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Topic provisioning parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

#[async_trait]
pub trait BusConsumer: Send {
    /// Block until the next message is available or the read fails
    async fn read(&mut self) -> Result<BusMessage, BusError>;

    /// Mark a message (and everything before it) as processed
    async fn commit(&mut self, message: &BusMessage) -> Result<(), BusError>;

    /// Topic this consumer is subscribed to (for logging)
    fn topic(&self) -> &str;
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), BusError>;
}

#[async_trait]
pub trait BusAdmin: Send + Sync {
    /// Create any missing topics; existing topics are left untouched
    async fn ensure_topics(&self, topics: &[TopicSpec]) -> Result<(), BusError>;
}

/// Consumer group name for a topic (`consumer-group-<topic>`)
pub fn consumer_group(topic: &str) -> String {
    format!("consumer-group-{}", topic)
}
