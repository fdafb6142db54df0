//! Dev-mode demo producer
//!
//! Publishes one schema event followed by a stream of query events picked
//! from a small fixed sample set, so the pipeline has something to ingest
//! without an external client.

use super::{BusProducer, BusError, OutboundMessage};
use crate::pipeline::types::{EventType, TYPE_HEADER};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Schema describing the sample query payloads
pub const DEMO_SCHEMA: &str = r#"{
    "Query": { "deal": "Deal", "user": "User" },
    "Deal": { "title": "String", "price": "Float", "user": "User" },
    "User": { "name": "String", "deals": "[Deal]" }
}"#;

/// Sample query payloads
pub const DEMO_QUERIES: [&str; 4] = [
    r#"{"deal":{"price":true},"user":{"id":true,"name":true}}"#,
    r#"{"deal":{"title":true,"price":true}}"#,
    r#"{"deal":{"title":true}}"#,
    r#"{"user":{"name":true,"deals":true}}"#,
];

#[derive(Debug, Clone)]
pub struct DemoProducerConfig {
    pub topic: String,
    pub query_events: usize,
    pub interval: Duration,
}

/// Publish the demo schema, then `query_events` queries one per interval
///
/// Returns the number of messages published. Stops early on cancellation.
pub async fn run_demo_producer(
    producer: Arc<dyn BusProducer>,
    config: DemoProducerConfig,
    shutdown: CancellationToken,
) -> Result<usize, BusError> {
    log::info!("🧪 Running demo producer on {}", config.topic);

    let mut message_key = 0usize;

    producer
        .publish(
            &config.topic,
            OutboundMessage::new(message_key.to_string(), DEMO_SCHEMA)
                .with_header(TYPE_HEADER, EventType::Schema.as_str()),
        )
        .await?;
    message_key += 1;

    for _ in 0..config.query_events {
        let payload = {
            let mut rng = rand::thread_rng();
            DEMO_QUERIES.choose(&mut rng).copied().unwrap_or(DEMO_QUERIES[0])
        };

        producer
            .publish(
                &config.topic,
                OutboundMessage::new(message_key.to_string(), payload)
                    .with_header(TYPE_HEADER, EventType::Query.as_str()),
            )
            .await?;
        message_key += 1;

        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("🧪 Demo producer cancelled after {} messages", message_key);
                return Ok(message_key);
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    log::info!("✅ Demo producer finished: {} messages", message_key);
    Ok(message_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn test_demo_producer_publishes_schema_first() {
        let bus = MemoryBus::with_topics(&["event.processor.test"]);
        let config = DemoProducerConfig {
            topic: "event.processor.test".to_string(),
            query_events: 3,
            interval: Duration::from_millis(1),
        };

        let sent = run_demo_producer(Arc::new(bus.clone()), config, CancellationToken::new())
            .await
            .unwrap();

        let messages = bus.messages("event.processor.test");
        assert_eq!(sent, 4);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].header(TYPE_HEADER), Some("Schema"));
        assert!(messages[1..]
            .iter()
            .all(|m| m.header(TYPE_HEADER) == Some("Query")));
        assert!(messages[1..]
            .iter()
            .all(|m| DEMO_QUERIES.contains(&m.payload.as_str())));
    }

    #[test]
    fn test_demo_payloads_are_valid_json() {
        serde_json::from_str::<serde_json::Value>(DEMO_SCHEMA).unwrap();
        for q in DEMO_QUERIES {
            serde_json::from_str::<serde_json::Value>(q).unwrap();
        }
    }
}
