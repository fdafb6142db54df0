//! Retry / dead-letter escalation for query events that failed to persist

use super::types::EventEnvelope;
use crate::bus::{BusProducer, OutboundMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Where an escalated envelope went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Published (or attempted) to the retry topic with this retry count
    Retry { retry_count: u32, published: bool },
    /// Retry budget exhausted; published (or attempted) to dead-letter
    DeadLetter { published: bool },
}

pub struct RetryEscalator {
    producer: Arc<dyn BusProducer>,
    retry_topic: String,
    dead_letter_topic: String,
    max_retries: u32,
    retry_interval: chrono::Duration,
}

impl RetryEscalator {
    pub fn new(
        producer: Arc<dyn BusProducer>,
        retry_topic: impl Into<String>,
        dead_letter_topic: impl Into<String>,
        max_retries: u32,
        retry_interval: chrono::Duration,
    ) -> Self {
        Self {
            producer,
            retry_topic: retry_topic.into(),
            dead_letter_topic: dead_letter_topic.into(),
            max_retries,
            retry_interval,
        }
    }

    pub async fn escalate(&self, envelope: &mut EventEnvelope) -> Escalation {
        self.escalate_at(envelope, Utc::now()).await
    }

    /// Route a failed envelope to retry or dead-letter
    ///
    /// Below the budget the count is incremented and `not_before` pushed out by
    /// the retry interval; at the budget the envelope is dead-lettered as is.
    /// A publish failure is logged and the envelope is still considered handled.
    /// An interval that pushes `not_before` past the representable range can
    /// never become eligible, so the envelope is dead-lettered instead.
    pub async fn escalate_at(&self, envelope: &mut EventEnvelope, now: DateTime<Utc>) -> Escalation {
        let retry_at = if envelope.retry_count < self.max_retries {
            let at = now.checked_add_signed(self.retry_interval);
            if at.is_none() {
                log::error!(
                    "❌ Retry interval {} overflows not_before, dead-lettering",
                    self.retry_interval
                );
            }
            at
        } else {
            None
        };

        if let Some(not_before) = retry_at {
            envelope.retry_count += 1;
            envelope.not_before = Some(not_before);

            let published = self.publish(&self.retry_topic, envelope, now).await;
            log::debug!(
                "🔁 Query event sent to retry topic (retry {}/{})",
                envelope.retry_count,
                self.max_retries
            );
            Escalation::Retry {
                retry_count: envelope.retry_count,
                published,
            }
        } else {
            let published = self.publish(&self.dead_letter_topic, envelope, now).await;
            log::warn!(
                "☠️  Query event dead-lettered after {} retries",
                envelope.retry_count
            );
            Escalation::DeadLetter { published }
        }
    }

    /// Put an envelope back on the retry topic without spending a retry
    ///
    /// Used for envelopes still queued when shutdown's drain timeout expires.
    pub async fn requeue(&self, envelope: &EventEnvelope) -> Escalation {
        let published = self.publish(&self.retry_topic, envelope, Utc::now()).await;
        Escalation::Retry {
            retry_count: envelope.retry_count,
            published,
        }
    }

    async fn publish(&self, topic: &str, envelope: &EventEnvelope, now: DateTime<Utc>) -> bool {
        let message = OutboundMessage::new(now.timestamp_millis().to_string(), envelope.payload.clone())
            .with_headers(envelope.headers());

        match self.producer.publish(topic, message).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("❌ Not able to write the message to {}: {}", topic, e);
                false
            }
        }
    }
}
