//! NATS JetStream message bus
//!
//! Topic mapping:
//! - one stream per topic, named after the topic with subject-only
//!   characters replaced (`event.processor.dev` -> `event_processor_dev`)
//! - the stream listens on exactly the topic name as its subject
//! - a consumer group is a durable pull consumer with explicit acks
//! - the message key travels in the `key` header next to the event headers
//! - `offset` is the JetStream stream sequence; `commit` acks it

use super::{
    consumer_group, BusAdmin, BusConsumer, BusError, BusMessage, BusProducer, Header,
    OutboundMessage, TopicSpec,
};
use async_nats::jetstream::{self, consumer::pull, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the producer-side message key
pub const KEY_HEADER: &str = "key";

/// Stream / consumer names may not contain subject tokens or whitespace
pub fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | '/' | '\\' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Durable consumer name for a topic's group
pub fn durable_name(topic: &str) -> String {
    stream_name(&consumer_group(topic))
}

fn to_header_map(message: &OutboundMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(KEY_HEADER, message.key.as_str());
    for header in &message.headers {
        headers.append(header.key.as_str(), header.value.as_str());
    }
    headers
}

/// Split a JetStream header map into the message key and the remaining headers
fn from_header_map(headers: Option<&HeaderMap>) -> (String, Vec<Header>) {
    let mut key = String::new();
    let mut out = Vec::new();

    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            let name = name.to_string();
            for value in values {
                if name == KEY_HEADER {
                    key = value.to_string();
                } else {
                    out.push(Header::new(name.clone(), value.to_string()));
                }
            }
        }
    }

    (key, out)
}

/// Connected JetStream context; producer and topic admin
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
}

impl NatsBus {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BusError> {
        info!("🔌 Connecting to NATS at {} (timeout={:?})", url, timeout);

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        info!("✅ Connected to NATS");
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Durable pull consumer on `topic` in the topic's default group
    ///
    /// `ack_wait` must outlast the longest time a message may sit between
    /// read and commit (including `not_before` parking), otherwise the
    /// server redelivers it.
    pub async fn consumer(&self, topic: &str, ack_wait: Duration) -> Result<NatsConsumer, BusError> {
        let read_err = |reason: String| BusError::Read {
            topic: topic.to_string(),
            reason,
        };

        let name = durable_name(topic);
        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                pull::Config {
                    name: Some(name.clone()),
                    durable_name: Some(name.clone()),
                    filter_subject: topic.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait,
                    ..Default::default()
                },
                stream_name(topic),
            )
            .await
            .map_err(|e| read_err(format!("failed to create consumer {}: {}", name, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| read_err(format!("failed to open message stream: {}", e)))?;

        debug!("Consumer {} attached to {}", name, topic);
        Ok(NatsConsumer {
            topic: topic.to_string(),
            messages,
            pending: HashMap::new(),
        })
    }
}

#[async_trait]
impl BusProducer for NatsBus {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), BusError> {
        let publish_err = |reason: String| BusError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let headers = to_header_map(&message);
        let ack = self
            .jetstream
            .publish_with_headers(topic.to_string(), headers, message.payload.into())
            .await
            .map_err(|e| publish_err(e.to_string()))?;

        ack.await
            .map_err(|e| publish_err(format!("no JetStream acknowledgment: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl BusAdmin for NatsBus {
    async fn ensure_topics(&self, topics: &[TopicSpec]) -> Result<(), BusError> {
        for spec in topics {
            let name = stream_name(&spec.name);

            if self.jetstream.get_stream(&name).await.is_ok() {
                debug!("Stream '{}' already exists", name);
                continue;
            }

            if spec.partitions > 1 {
                debug!(
                    "Stream '{}' is a single ordered log; {} partitions not applicable",
                    name, spec.partitions
                );
            }

            self.jetstream
                .create_stream(StreamConfig {
                    name: name.clone(),
                    subjects: vec![spec.name.clone()],
                    description: Some(format!("Event processor topic {}", spec.name)),
                    num_replicas: spec.replication_factor as usize,
                    ..Default::default()
                })
                .await
                .map_err(|e| BusError::Provision {
                    topic: spec.name.clone(),
                    reason: e.to_string(),
                })?;

            info!(
                "   ├─ Created stream {} for {} (replicas: {})",
                name, spec.name, spec.replication_factor
            );
        }
        Ok(())
    }
}

/// Pull consumer bound to one topic
///
/// Messages read but not yet committed are held so `commit` can ack them.
pub struct NatsConsumer {
    topic: String,
    messages: pull::Stream,
    pending: HashMap<u64, jetstream::Message>,
}

#[async_trait]
impl BusConsumer for NatsConsumer {
    async fn read(&mut self) -> Result<BusMessage, BusError> {
        let read_err = |reason: String| BusError::Read {
            topic: self.topic.clone(),
            reason,
        };

        let message = match self.messages.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(read_err(e.to_string())),
            None => return Err(read_err("message stream closed".to_string())),
        };

        let offset = message
            .info()
            .map_err(|e| read_err(format!("missing delivery info: {}", e)))?
            .stream_sequence;

        let payload = match std::str::from_utf8(&message.payload) {
            Ok(payload) => payload.to_string(),
            Err(e) => {
                // Never decodable; ack it so it is not redelivered forever
                warn!("⚠️  Dropping non-UTF-8 message {} on {}: {}", offset, self.topic, e);
                if let Err(e) = message.ack().await {
                    warn!("⚠️  Failed to ack dropped message {}: {}", offset, e);
                }
                return Err(read_err(format!("payload at {} is not UTF-8", offset)));
            }
        };

        let (key, headers) = from_header_map(message.headers.as_ref());
        let bus_message = BusMessage {
            topic: self.topic.clone(),
            offset,
            key,
            headers,
            payload,
        };

        self.pending.insert(offset, message);
        Ok(bus_message)
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<(), BusError> {
        let commit_err = |reason: String| BusError::Commit {
            topic: message.topic.clone(),
            offset: message.offset,
            reason,
        };

        let pending = self
            .pending
            .remove(&message.offset)
            .ok_or_else(|| commit_err("message was not read by this consumer".to_string()))?;

        pending.ack().await.map_err(|e| commit_err(e.to_string()))
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
