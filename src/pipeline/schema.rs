//! Schema registry: flattening schema documents into field paths
//!
//! A schema document is an arbitrary-depth JSON object. Every leaf field
//! becomes one `SchemaPath` (comma-joined, lowercased keys). Each accepted
//! schema event replaces the in-memory snapshot wholesale and appends the
//! same paths to the store under a new generation.
//!
//! Readers take an `Arc<SchemaSnapshot>`; writers swap the pointer under a
//! short write lock, so an aggregation call never sees two generations mixed.

use super::db::QueryStore;
use super::types::SchemaPath;
use crate::error::IngestError;
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};

/// One complete generation of known schema paths
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaSnapshot {
    pub generation: u64,
    pub paths: Vec<SchemaPath>,
}

impl SchemaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Process-wide holder of the current schema snapshot
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    current: RwLock<Arc<SchemaSnapshot>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with a previously persisted generation
    pub fn with_snapshot(generation: u64, paths: Vec<SchemaPath>) -> Self {
        Self {
            current: RwLock::new(Arc::new(SchemaSnapshot { generation, paths })),
        }
    }

    /// Parse and flatten a schema document
    ///
    /// Fails with `InvalidDocument` if the text is not JSON or its top level
    /// is not an object. Does not touch the snapshot.
    pub fn flatten(document: &str) -> Result<Vec<SchemaPath>, IngestError> {
        let value: Value = serde_json::from_str(document)?;
        match value {
            Value::Object(map) => Ok(flatten_object(&map)),
            other => Err(IngestError::InvalidDocument(format!(
                "schema document must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// The live snapshot (cheap clone of an `Arc`)
    pub fn current_snapshot(&self) -> Arc<SchemaSnapshot> {
        // The write section is a pointer swap and cannot leave torn state
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot with `paths` as the next generation
    pub fn replace(&self, paths: Vec<SchemaPath>) -> Arc<SchemaSnapshot> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(SchemaSnapshot {
            generation: guard.generation + 1,
            paths,
        });
        *guard = next.clone();
        next
    }
}

/// Walk an object top-down in its own key order, emitting one path per leaf
pub fn flatten_object(document: &Map<String, Value>) -> Vec<SchemaPath> {
    let mut paths = Vec::new();
    walk(document, None, &mut paths);
    paths
}

fn walk(node: &Map<String, Value>, parent: Option<&SchemaPath>, out: &mut Vec<SchemaPath>) {
    for (key, value) in node {
        let path = SchemaPath::child(parent, &key.to_lowercase());
        match value {
            Value::Object(child) => walk(child, Some(&path), out),
            _ => out.push(path),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Handles `Schema` events synchronously on the consume side
pub struct SchemaEventHandler {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn QueryStore>,
}

impl SchemaEventHandler {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn QueryStore>) -> Self {
        Self { registry, store }
    }

    /// Flatten, swap the registry snapshot, then append the paths to the store
    ///
    /// The in-memory snapshot is replaced even if the durable append fails;
    /// that failure is returned (and logged by the caller) but not retried.
    pub async fn save_schema(&self, document: &str) -> Result<Arc<SchemaSnapshot>, IngestError> {
        let paths = SchemaRegistry::flatten(document)?;
        let snapshot = self.registry.replace(paths);

        log::debug!(
            "Schema generation {} flattened into {} paths",
            snapshot.generation,
            snapshot.paths.len()
        );

        self.store
            .insert_schema_paths(snapshot.generation, &snapshot.paths)
            .await
            .map_err(IngestError::StoreWrite)?;

        log::info!(
            "📐 Parsed schema saved: generation {} ({} paths)",
            snapshot.generation,
            snapshot.paths.len()
        );
        Ok(snapshot)
    }
}
