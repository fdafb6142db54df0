//! In-process message bus with per-topic append-only logs
//!
//! Semantics mirror a partitioned log closely enough for the pipeline:
//! - each topic is an ordered log addressed by offset
//! - consumers belong to a group; a new consumer resumes from the group's
//!   committed offset, so uncommitted messages are redelivered
//! - blocked readers are woken through a shared `Notify`
//! - nothing is ever evicted, so every published message stays inspectable;
//!   long-running processes use `NatsBus` instead

use super::{
    consumer_group, BusAdmin, BusConsumer, BusError, BusMessage, BusProducer, OutboundMessage,
    TopicSpec,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicLog>,
    /// (group, topic) -> next offset to read
    committed: HashMap<(String, String), u64>,
    fail_publishes: bool,
}

struct TopicLog {
    spec: TopicSpec,
    messages: Vec<BusMessage>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BusState>,
    notify: Notify,
}

impl Inner {
    // Critical sections never panic, so a poisoned guard is still consistent
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a shared in-memory bus
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with the given topics already provisioned (1 partition, RF 1)
    pub fn with_topics(names: &[&str]) -> Self {
        let bus = Self::new();
        {
            let mut state = bus.inner.state();
            for name in names {
                state.topics.insert(
                    name.to_string(),
                    TopicLog {
                        spec: TopicSpec {
                            name: name.to_string(),
                            partitions: 1,
                            replication_factor: 1,
                        },
                        messages: Vec::new(),
                    },
                );
            }
        }
        bus
    }

    /// Consumer on `topic` in the default group for that topic
    pub fn consumer(&self, topic: &str) -> MemoryConsumer {
        self.consumer_in_group(topic, &consumer_group(topic))
    }

    /// Consumer resuming from the group's committed offset
    pub fn consumer_in_group(&self, topic: &str, group: &str) -> MemoryConsumer {
        let position = self
            .inner
            .state()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0);

        MemoryConsumer {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            position,
        }
    }

    /// Make every subsequent publish fail (broker outage)
    pub fn set_fail_publishes(&self, fail: bool) {
        self.inner.state().fail_publishes = fail;
    }

    /// Snapshot of everything ever published to `topic`
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, topic: &str, group: &str) -> u64 {
        self.inner
            .state()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn topic_spec(&self, topic: &str) -> Option<TopicSpec> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|log| log.spec.clone())
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), BusError> {
        {
            let mut state = self.inner.state();
            if state.fail_publishes {
                return Err(BusError::Publish {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }

            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

            let offset = log.messages.len() as u64;
            log.messages.push(BusMessage {
                topic: topic.to_string(),
                offset,
                key: message.key,
                headers: message.headers,
                payload: message.payload,
            });
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BusAdmin for MemoryBus {
    async fn ensure_topics(&self, topics: &[TopicSpec]) -> Result<(), BusError> {
        let mut state = self.inner.state();
        for spec in topics {
            if state.topics.contains_key(&spec.name) {
                log::debug!("Topic already exists: {}", spec.name);
                continue;
            }
            log::info!(
                "   ├─ Created topic {} (partitions: {}, replication: {})",
                spec.name,
                spec.partitions,
                spec.replication_factor
            );
            state.topics.insert(
                spec.name.clone(),
                TopicLog {
                    spec: spec.clone(),
                    messages: Vec::new(),
                },
            );
        }
        Ok(())
    }
}

/// Reader over one topic log
pub struct MemoryConsumer {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    position: u64,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn read(&mut self) -> Result<BusMessage, BusError> {
        let inner = self.inner.clone();
        loop {
            // Register interest before checking the log so a concurrent
            // publish between the check and the await is not missed
            let notified = inner.notify.notified();

            {
                let state = inner.state();
                let log = state.topics.get(&self.topic).ok_or_else(|| BusError::Read {
                    topic: self.topic.clone(),
                    reason: "topic not found".to_string(),
                })?;

                if let Some(message) = log.messages.get(self.position as usize) {
                    self.position += 1;
                    return Ok(message.clone());
                }
            }

            notified.await;
        }
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<(), BusError> {
        if message.topic != self.topic {
            return Err(BusError::Commit {
                topic: message.topic.clone(),
                offset: message.offset,
                reason: format!("consumer is subscribed to {}", self.topic),
            });
        }

        let mut state = self.inner.state();
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(message.offset + 1);
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
