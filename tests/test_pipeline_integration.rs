//! Integration tests for the event processor pipeline
//!
//! Tests run the real workers against the in-memory bus and a temporary
//! SQLite database:
//! - Demo traffic flows through to aggregation totals
//! - Retried events are parked until `not_before`, then persisted
//! - A restarted process warm-starts the registry from the store
//! - Dead-lettering after the retry budget is exhausted

#[cfg(test)]
mod pipeline_integration_tests {
    use queryflow::bus::demo_producer::{run_demo_producer, DemoProducerConfig, DEMO_SCHEMA};
    use queryflow::bus::{BusAdmin, BusConsumer, BusProducer, MemoryBus, OutboundMessage};
    use queryflow::config::AppConfig;
    use queryflow::pipeline::aggregation::reassemble;
    use queryflow::pipeline::types::{FlatRow, RETRY_COUNT_HEADER, TYPE_HEADER};
    use queryflow::pipeline::{
        AggregationService, EventEnvelope, IngestionPipeline, PipelineConfig, QueryStore,
        RetryEscalator, SchemaRegistry, SqliteQueryStore, StatsSnapshot,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_util::sync::CancellationToken;

    struct Env {
        _temp: NamedTempFile,
        db_path: String,
        bus: MemoryBus,
        config: AppConfig,
        store: Arc<SqliteQueryStore>,
    }

    async fn setup() -> Env {
        let temp = NamedTempFile::new().unwrap();
        let db_path = temp.path().to_str().unwrap().to_string();
        let config = AppConfig::from_vars(|key| match key {
            "ENV" => Some("it".to_string()),
            _ => None,
        })
        .unwrap();

        let store = Arc::new(SqliteQueryStore::open_migrated(&db_path, "sql").unwrap());
        let bus = MemoryBus::new();
        bus.ensure_topics(&config.topics.specs()).await.unwrap();

        Env {
            _temp: temp,
            db_path,
            bus,
            config,
            store,
        }
    }

    fn start_pipeline(
        env: &Env,
        registry: Arc<SchemaRegistry>,
        pipeline_config: PipelineConfig,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<StatsSnapshot> {
        let escalator = RetryEscalator::new(
            Arc::new(env.bus.clone()),
            env.config.topics.retry.clone(),
            env.config.topics.dead_letter.clone(),
            pipeline_config.max_retry_count,
            pipeline_config.retry_interval(),
        );
        let pipeline =
            IngestionPipeline::new(registry, env.store.clone(), escalator, pipeline_config);
        let consumers: Vec<Box<dyn BusConsumer>> = vec![
            Box::new(env.bus.consumer(&env.config.topics.primary)),
            Box::new(env.bus.consumer(&env.config.topics.retry)),
        ];
        tokio::spawn(pipeline.run(consumers, shutdown))
    }

    async fn wait_for_records(store: &SqliteQueryStore, expected: i64) {
        for _ in 0..300 {
            if store.query_record_count().unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {} records, have {}",
            expected,
            store.query_record_count().unwrap()
        );
    }

    /// Expected totals, computed directly from the published payloads
    fn expected_totals(payloads: &[Value], paths: &[&str]) -> Value {
        let mut flat = FlatRow::new();
        for path in paths {
            let stripped = path.strip_prefix("query,").unwrap_or(path);
            let pointer = format!("/{}", stripped.replace(',', "/"));
            let count = payloads
                .iter()
                .filter(|p| p.pointer(&pointer).map_or(false, |v| !v.is_null()))
                .count();
            flat.insert(path.to_string(), json!(count));
        }
        reassemble(&flat)
    }

    #[tokio::test]
    async fn test_demo_traffic_reaches_totals() {
        // Test: schema + random queries from the demo producer end up in totals
        let env = setup().await;
        let registry = Arc::new(SchemaRegistry::new());
        let shutdown = CancellationToken::new();

        let sent = run_demo_producer(
            Arc::new(env.bus.clone()),
            DemoProducerConfig {
                topic: env.config.topics.primary.clone(),
                query_events: 12,
                interval: Duration::from_millis(1),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sent, 13);

        let handle = start_pipeline(&env, registry.clone(), PipelineConfig::default(), shutdown.clone());
        wait_for_records(&env.store, 12).await;
        shutdown.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(stats.schemas_saved, 1);
        assert_eq!(stats.queries_persisted, 12);

        let payloads: Vec<Value> = env
            .bus
            .messages(&env.config.topics.primary)
            .iter()
            .filter(|m| m.header(TYPE_HEADER) == Some("Query"))
            .map(|m| serde_json::from_str(&m.payload).unwrap())
            .collect();

        let service = AggregationService::new(registry, env.store.clone());
        let totals = service.get_total_counts().await.unwrap();
        assert_eq!(
            totals,
            expected_totals(
                &payloads,
                &[
                    "query,deal",
                    "query,user",
                    "deal,title",
                    "deal,price",
                    "deal,user",
                    "user,name",
                    "user,deals",
                ]
            )
        );
    }

    #[tokio::test]
    async fn test_retry_topic_event_is_parked_then_persisted() {
        // Test: an event on the retry topic is held until not_before
        let env = setup().await;
        let shutdown = CancellationToken::new();
        let not_before = chrono::Utc::now() + chrono::Duration::milliseconds(300);
        let envelope = EventEnvelope::query(r#"{"deal":{"price":true}}"#).with_retry(2, Some(not_before));

        env.bus
            .publish(
                &env.config.topics.retry,
                OutboundMessage::new("r", envelope.payload.clone()).with_headers(envelope.headers()),
            )
            .await
            .unwrap();

        let handle = start_pipeline(
            &env,
            Arc::new(SchemaRegistry::new()),
            PipelineConfig::default(),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(env.store.query_record_count().unwrap(), 0);

        wait_for_records(&env.store, 1).await;
        assert!(chrono::Utc::now() >= not_before);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_warm_starts_registry() {
        // Test: a second process aggregates before any new schema event
        let env = setup().await;
        let shutdown = CancellationToken::new();
        let primary = env.config.topics.primary.clone();

        env.bus
            .publish(&primary, OutboundMessage::new("0", DEMO_SCHEMA).with_header(TYPE_HEADER, "Schema"))
            .await
            .unwrap();
        env.bus
            .publish(
                &primary,
                OutboundMessage::new("1", r#"{"deal":{"title":true}}"#).with_header(TYPE_HEADER, "Query"),
            )
            .await
            .unwrap();

        let handle = start_pipeline(
            &env,
            Arc::new(SchemaRegistry::new()),
            PipelineConfig::default(),
            shutdown.clone(),
        );
        wait_for_records(&env.store, 1).await;
        shutdown.cancel();
        handle.await.unwrap();

        // "Restart": fresh store handle and registry from disk
        let reopened: Arc<SqliteQueryStore> =
            Arc::new(SqliteQueryStore::open_migrated(&env.db_path, "sql").unwrap());
        let (generation, paths) = reopened.latest_schema_paths().await.unwrap().unwrap();
        assert_eq!(generation, 1);
        assert_eq!(paths.len(), 7);

        let registry = Arc::new(SchemaRegistry::with_snapshot(generation, paths));
        let service = AggregationService::new(registry, reopened);
        let totals = service.get_total_counts().await.unwrap();
        assert_eq!(totals["deal"]["title"], 1);
        assert_eq!(totals["query"]["deal"], 1);
        assert_eq!(totals["user"]["name"], 0);
    }

    #[tokio::test]
    async fn test_exhausted_event_is_dead_lettered() {
        // Test: a store failure on an event at the retry budget goes to the DLQ
        let env = setup().await;
        let shutdown = CancellationToken::new();
        {
            let conn = rusqlite::Connection::open(&env.db_path).unwrap();
            conn.execute_batch("DROP TABLE query_events").unwrap();
        }

        let envelope = EventEnvelope::query(r#"{"deal":{"price":true}}"#).with_retry(10, None);
        env.bus
            .publish(
                &env.config.topics.retry,
                OutboundMessage::new("r", envelope.payload.clone()).with_headers(envelope.headers()),
            )
            .await
            .unwrap();

        let handle = start_pipeline(
            &env,
            Arc::new(SchemaRegistry::new()),
            PipelineConfig::default(),
            shutdown.clone(),
        );

        let dlq = env.config.topics.dead_letter.clone();
        for _ in 0..300 {
            if !env.bus.messages(&dlq).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        let stats = handle.await.unwrap();

        let dead = env.bus.messages(&dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(RETRY_COUNT_HEADER), Some("10"));
        assert_eq!(stats.queries_dead_lettered, 1);
        // Nothing new on the retry topic beyond the original message
        assert_eq!(env.bus.messages(&env.config.topics.retry).len(), 1);
    }
}
