//! Error taxonomy shared by the ingestion and aggregation sides
//!
//! Ingestion errors never halt the consume loop: they are either escalated
//! (store writes), or dropped and logged (invalid documents, bad headers).
//! Aggregation errors map one-to-one onto caller-visible outcomes and never
//! carry store detail.

use thiserror::Error;

/// Failures talking to the relational store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema directory not found: {0}")]
    SchemaDirNotFound(String),

    #[error("Store connection lock poisoned")]
    LockPoisoned,
}

/// Failures on the ingestion side of the pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed schema or query payload (dropped, never retried)
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Store rejected the write (query events are escalated)
    #[error("Store write failed: {0}")]
    StoreWrite(#[source] StoreError),
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::InvalidDocument(err.to_string())
    }
}

/// Caller-visible aggregation outcomes other than success
///
/// Messages are deliberately generic; the underlying store error is logged
/// where it happens and dropped here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Query not available")]
    NotFound,

    #[error("Failed to get count")]
    Internal,
}

pub type AggregateResult<T> = Result<T, AggregateError>;
