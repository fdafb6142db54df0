//! Runtime configuration from environment variables
//!
//! Every variable has a default; a variable that is set but unparsable is an
//! error rather than a silent fallback.

use crate::bus::TopicSpec;
use crate::pipeline::config::PipelineConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `RETRY_TIME_INTERVAL` (one year, in minutes)
pub const MAX_RETRY_INTERVAL_MINUTES: i64 = 525_600;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Which message bus the runtime connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    /// NATS JetStream at `NATS_URL`
    Nats,
    /// In-process bus; messages live only as long as the process
    Memory,
}

impl FromStr for BusBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nats" | "jetstream" => Ok(BusBackend::Nats),
            "memory" => Ok(BusBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "BUS_BACKEND must be nats or memory, got '{}'",
                other
            ))),
        }
    }
}

/// Topic names and provisioning parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub primary: String,
    pub retry: String,
    pub dead_letter: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

impl TopicConfig {
    pub fn primary_for(env: &str) -> String {
        format!("event.processor.{}", env)
    }

    pub fn retry_for(env: &str) -> String {
        format!("event.processor.consumer.retry.{}", env)
    }

    pub fn dead_letter_for(env: &str) -> String {
        format!("event.processor.consumer.dlq.{}", env)
    }

    /// All three topics with the configured partitions / replication
    pub fn specs(&self) -> Vec<TopicSpec> {
        [&self.primary, &self.retry, &self.dead_letter]
            .into_iter()
            .map(|name| TopicSpec {
                name: name.clone(),
                partitions: self.partitions,
                replication_factor: self.replication_factor,
            })
            .collect()
    }
}

/// Configuration for the `event_processor` runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Deployment environment, used in default topic names
    pub env: String,

    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` migrations
    pub schema_dir: String,

    pub topics: TopicConfig,

    pub bus_backend: BusBackend,

    /// NATS server URL (JetStream backend only)
    pub nats_url: String,

    /// Timeout for establishing the NATS connection
    pub nats_connect_timeout_secs: u64,

    pub pipeline: PipelineConfig,

    /// Publish sample schema + query events on startup
    pub demo_producer_enabled: bool,

    /// Number of sample query events the demo producer sends
    pub demo_query_events: usize,
}

impl AppConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `ENV` (default: dev)
    /// - `EVENT_PROCESSOR_DB_PATH` (default: event_processor.db)
    /// - `SCHEMA_DIR` (default: sql)
    /// - `QUEUE_CAPACITY` (default: 1000)
    /// - `MAX_RETRY_COUNT` (default: 10)
    /// - `RETRY_TIME_INTERVAL` (default: 1, minutes)
    /// - `SHUTDOWN_DRAIN_TIMEOUT_MS` (default: 5000)
    /// - `READ_BACKOFF_INITIAL_MS` (default: 100)
    /// - `READ_BACKOFF_MAX_MS` (default: 30000)
    /// - `READ_FAILURE_CIRCUIT_THRESHOLD` (default: 10)
    /// - `TOPIC_PARTITIONS` (default: 100)
    /// - `REPLICATION_FACTOR` (default: 1)
    /// - `KAFKA_TOPIC`, `KAFKA_RETRY_TOPIC`, `KAFKA_DLQ_TOPIC` (default: derived from ENV)
    /// - `BUS_BACKEND` (default: nats; `memory` for an in-process bus)
    /// - `NATS_URL` (default: nats://localhost:4222)
    /// - `NATS_CONNECT_TIMEOUT_SECS` (default: 10)
    /// - `ENABLE_DEMO_PRODUCER` (default: true)
    /// - `DEMO_QUERY_EVENTS` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let env = var("ENV").unwrap_or_else(|| "dev".to_string());
        let defaults = PipelineConfig::default();

        let pipeline = PipelineConfig {
            queue_capacity: parse_or(&var, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_retry_count: parse_or(&var, "MAX_RETRY_COUNT", defaults.max_retry_count)?,
            retry_interval_minutes: parse_or(
                &var,
                "RETRY_TIME_INTERVAL",
                defaults.retry_interval_minutes,
            )?,
            drain_timeout_ms: parse_or(&var, "SHUTDOWN_DRAIN_TIMEOUT_MS", defaults.drain_timeout_ms)?,
            read_backoff_initial_ms: parse_or(
                &var,
                "READ_BACKOFF_INITIAL_MS",
                defaults.read_backoff_initial_ms,
            )?,
            read_backoff_max_ms: parse_or(&var, "READ_BACKOFF_MAX_MS", defaults.read_backoff_max_ms)?,
            read_failure_circuit_threshold: parse_or(
                &var,
                "READ_FAILURE_CIRCUIT_THRESHOLD",
                defaults.read_failure_circuit_threshold,
            )?,
        };

        if pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if !(0..=MAX_RETRY_INTERVAL_MINUTES).contains(&pipeline.retry_interval_minutes) {
            return Err(ConfigError::InvalidValue(format!(
                "RETRY_TIME_INTERVAL must be between 0 and {} minutes",
                MAX_RETRY_INTERVAL_MINUTES
            )));
        }
        if pipeline.read_backoff_initial_ms == 0
            || pipeline.read_backoff_max_ms < pipeline.read_backoff_initial_ms
        {
            return Err(ConfigError::InvalidValue(
                "READ_BACKOFF_INITIAL_MS must be > 0 and <= READ_BACKOFF_MAX_MS".to_string(),
            ));
        }

        let topics = TopicConfig {
            primary: var("KAFKA_TOPIC").unwrap_or_else(|| TopicConfig::primary_for(&env)),
            retry: var("KAFKA_RETRY_TOPIC").unwrap_or_else(|| TopicConfig::retry_for(&env)),
            dead_letter: var("KAFKA_DLQ_TOPIC")
                .unwrap_or_else(|| TopicConfig::dead_letter_for(&env)),
            partitions: parse_or(&var, "TOPIC_PARTITIONS", 100)?,
            replication_factor: parse_or(&var, "REPLICATION_FACTOR", 1)?,
        };

        if topics.partitions == 0 || topics.replication_factor == 0 {
            return Err(ConfigError::InvalidValue(
                "TOPIC_PARTITIONS and REPLICATION_FACTOR must be greater than 0".to_string(),
            ));
        }

        let bus_backend = match var("BUS_BACKEND") {
            None => BusBackend::Nats,
            Some(value) => value.parse()?,
        };

        let demo_producer_enabled = match var("ENABLE_DEMO_PRODUCER") {
            None => true,
            Some(value) => parse_flag(&value).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "ENABLE_DEMO_PRODUCER must be true or false, got '{}'",
                    value
                ))
            })?,
        };

        Ok(Self {
            db_path: var("EVENT_PROCESSOR_DB_PATH")
                .unwrap_or_else(|| "event_processor.db".to_string()),
            schema_dir: var("SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),
            topics,
            bus_backend,
            nats_url: var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            nats_connect_timeout_secs: parse_or(&var, "NATS_CONNECT_TIMEOUT_SECS", 10)?,
            pipeline,
            demo_producer_enabled,
            demo_query_events: parse_or(&var, "DEMO_QUERY_EVENTS", 10)?,
            env,
        })
    }

    pub fn nats_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.nats_connect_timeout_secs)
    }

    pub fn log_summary(&self) {
        log::info!("⚙️  Configuration:");
        log::info!("   ├─ Environment: {}", self.env);
        log::info!("   ├─ Database: {}", self.db_path);
        log::info!("   ├─ Schema dir: {}", self.schema_dir);
        match self.bus_backend {
            BusBackend::Nats => log::info!("   ├─ Bus: NATS JetStream at {}", self.nats_url),
            BusBackend::Memory => log::info!("   ├─ Bus: in-memory"),
        }
        log::info!("   ├─ Topic: {}", self.topics.primary);
        log::info!("   ├─ Retry topic: {}", self.topics.retry);
        log::info!("   ├─ Dead-letter topic: {}", self.topics.dead_letter);
        log::info!(
            "   ├─ Partitions / replication: {} / {}",
            self.topics.partitions,
            self.topics.replication_factor
        );
        log::info!("   ├─ Queue capacity: {}", self.pipeline.queue_capacity);
        log::info!(
            "   ├─ Retries: {} every {} min",
            self.pipeline.max_retry_count,
            self.pipeline.retry_interval_minutes
        );
        log::info!("   ├─ Drain timeout: {}ms", self.pipeline.drain_timeout_ms);
        log::info!(
            "   └─ Demo producer: {}",
            if self.demo_producer_enabled { "enabled" } else { "disabled" }
        );
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{} has an unparsable value '{}'", key, raw))
        }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_vars(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        // Test: Default configuration when no env vars set
        let config = load(&[]).unwrap();

        assert_eq!(config.env, "dev");
        assert_eq!(config.db_path, "event_processor.db");
        assert_eq!(config.schema_dir, "sql");
        assert_eq!(config.topics.primary, "event.processor.dev");
        assert_eq!(config.topics.retry, "event.processor.consumer.retry.dev");
        assert_eq!(config.topics.dead_letter, "event.processor.consumer.dlq.dev");
        assert_eq!(config.topics.partitions, 100);
        assert_eq!(config.topics.replication_factor, 1);
        assert_eq!(config.bus_backend, BusBackend::Nats);
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.nats_connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert!(config.demo_producer_enabled);
        assert_eq!(config.demo_query_events, 10);
    }

    #[test]
    fn test_custom_config() {
        // Test: Custom configuration from env vars
        let config = load(&[
            ("ENV", "prod"),
            ("EVENT_PROCESSOR_DB_PATH", "/tmp/test.db"),
            ("QUEUE_CAPACITY", "50"),
            ("MAX_RETRY_COUNT", "3"),
            ("RETRY_TIME_INTERVAL", "5"),
            ("KAFKA_DLQ_TOPIC", "custom.dlq"),
            ("ENABLE_DEMO_PRODUCER", "false"),
            ("BUS_BACKEND", "Memory"),
            ("NATS_URL", "nats://broker:4222"),
        ])
        .unwrap();

        assert_eq!(config.bus_backend, BusBackend::Memory);
        assert_eq!(config.nats_url, "nats://broker:4222");

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.topics.primary, "event.processor.prod");
        assert_eq!(config.topics.dead_letter, "custom.dlq");
        assert_eq!(config.pipeline.queue_capacity, 50);
        assert_eq!(config.pipeline.max_retry_count, 3);
        assert_eq!(config.pipeline.retry_interval(), chrono::Duration::minutes(5));
        assert!(!config.demo_producer_enabled);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("QUEUE_CAPACITY", "0")],
            [("QUEUE_CAPACITY", "lots")],
            [("MAX_RETRY_COUNT", "-1")],
            [("ENABLE_DEMO_PRODUCER", "maybe")],
            [("READ_BACKOFF_MAX_MS", "10")],
            [("TOPIC_PARTITIONS", "0")],
            [("BUS_BACKEND", "kafka")],
            [("RETRY_TIME_INTERVAL", "-1")],
        ] {
            assert!(
                matches!(load(&vars), Err(ConfigError::InvalidValue(_))),
                "expected InvalidValue for {:?}",
                vars
            );
        }
    }

    #[test]
    fn test_retry_interval_upper_bound() {
        // Test: an interval that would overflow a timestamp is rejected up front
        let err = load(&[("RETRY_TIME_INTERVAL", "100000000000000")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref msg) if msg.contains("RETRY_TIME_INTERVAL")));

        let max = MAX_RETRY_INTERVAL_MINUTES.to_string();
        let config = load(&[("RETRY_TIME_INTERVAL", max.as_str())]).unwrap();
        assert_eq!(
            config.pipeline.retry_interval(),
            chrono::Duration::minutes(MAX_RETRY_INTERVAL_MINUTES)
        );

        let over = (MAX_RETRY_INTERVAL_MINUTES + 1).to_string();
        assert!(load(&[("RETRY_TIME_INTERVAL", over.as_str())]).is_err());
    }

    #[test]
    fn test_topic_specs() {
        let config = load(&[("TOPIC_PARTITIONS", "4"), ("REPLICATION_FACTOR", "3")]).unwrap();
        let specs = config.topics.specs();

        assert_eq!(specs.len(), 3);
        assert!(specs.iter().all(|s| s.partitions == 4 && s.replication_factor == 3));
        assert_eq!(specs[1].name, "event.processor.consumer.retry.dev");
    }
}
