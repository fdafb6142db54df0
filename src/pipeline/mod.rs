//! # Query Event Pipeline
//!
//! Ingests two kinds of bus events and serves counts over them:
//! - **Schema** events describe the shape of client query payloads. They are
//!   flattened into comma-joined field paths (`deal,title`) that replace the
//!   registry snapshot and are appended to the store.
//! - **Query** events are client payloads. They are queued, persisted
//!   verbatim, and escalated through the retry / dead-letter topics when the
//!   store rejects them.
//!
//! ## Architecture
//!
//! ```text
//! bus ─► ConsumeWorker ─┬─ Schema ─► SchemaEventHandler ─► registry + store
//!                       └─ Query ──► mpsc queue ─► PersistWorker ─► store
//!                                                       └─ failure ─► RetryEscalator
//! AggregationService ─► registry snapshot ─► count expressions ─► store ─► nested JSON
//! ```
//!
//! ## Schema Reference
//!
//! All persisted types match SQL schema in `/sql/`:
//! - `query_events` → `QueryRecord`
//! - `parsed_schema_events` → `SchemaPath` (+ generation, position)
//!
//! ## Module Organization
//!
//! - `types` - Envelopes, decoded events, schema paths, query records
//! - `schema` - Schema registry and schema event handling
//! - `query_events` - Query payload validation and persistence
//! - `retry` - Retry / dead-letter escalation
//! - `backoff` - Bus read backoff with circuit reporting
//! - `ingestion` - Consume and persist workers
//! - `aggregation` - Count expressions, grouping, reassembly
//! - `db` - Store trait and SQLite implementation
//! - `config` - Worker tuning knobs

pub mod aggregation;
pub mod backoff;
pub mod config;
pub mod db;
pub mod ingestion;
pub mod query_events;
pub mod retry;
pub mod schema;
pub mod types;

// Re-export commonly used types
pub use aggregation::{AggregationService, Dimension, Grouping};
pub use config::PipelineConfig;
pub use db::{QueryStore, SqliteQueryStore};
pub use ingestion::{IngestionPipeline, StatsSnapshot};
pub use retry::{Escalation, RetryEscalator};
pub use schema::{SchemaEventHandler, SchemaRegistry, SchemaSnapshot};
pub use types::{EventEnvelope, EventType, InboundEvent, QueryRecord, SchemaPath};
