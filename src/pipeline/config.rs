//! Pipeline tuning knobs
//!
//! Parsed from the environment by `crate::config::AppConfig`; defaults here
//! are the ones used when a variable is unset.

use std::time::Duration;

/// Configuration for the consume / persist workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bounded queue between consume and persist workers (events)
    pub queue_capacity: usize,

    /// Retry budget before a query event is dead-lettered
    pub max_retry_count: u32,

    /// Delay before a retried event may be redelivered (minutes)
    pub retry_interval_minutes: i64,

    /// How long shutdown keeps persisting queued events (milliseconds)
    pub drain_timeout_ms: u64,

    /// First delay after a failed bus read (milliseconds)
    pub read_backoff_initial_ms: u64,

    /// Cap on the bus read delay (milliseconds)
    pub read_backoff_max_ms: u64,

    /// Consecutive read failures before the circuit is reported open
    pub read_failure_circuit_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            max_retry_count: 10,
            retry_interval_minutes: 1,
            drain_timeout_ms: 5_000,
            read_backoff_initial_ms: 100,
            read_backoff_max_ms: 30_000,
            read_failure_circuit_threshold: 10,
        }
    }
}

impl PipelineConfig {
    pub fn retry_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retry_interval_minutes)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn read_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.read_backoff_initial_ms)
    }

    pub fn read_backoff_max(&self) -> Duration {
        Duration::from_millis(self.read_backoff_max_ms)
    }
}
