//! Aggregation over stored query events
//!
//! Counts, for every known schema path, how many stored queries requested
//! that field. Results come back from the store as flat rows keyed by the
//! comma-joined path and are reassembled into nested objects here.

use super::db::QueryStore;
use super::schema::SchemaRegistry;
use super::types::{FlatRow, SchemaPath};
use crate::error::{AggregateError, AggregateResult};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Row key carrying the `YYYY-MM-DD` day in by-day results
pub const PROCESSED_DAY_KEY: &str = "processed_time";

/// Leading segment that names the root query type rather than a field
const QUERY_ROOT_PREFIX: &str = "query,";

/// One count column: result alias plus the JSON path it counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountExpression {
    /// Full original schema path, used as the result key
    pub alias: String,
    /// SQLite JSON path (`$."deal"."price"`), always bound as a parameter
    pub json_path: String,
}

/// Build one count expression per schema path, in snapshot order
pub fn build_count_expressions(paths: &[SchemaPath]) -> Vec<CountExpression> {
    paths
        .iter()
        .map(|path| {
            let raw = path.as_str();
            let stripped = raw.strip_prefix(QUERY_ROOT_PREFIX).unwrap_or(raw);

            let mut json_path = String::from("$");
            for segment in stripped.split(SchemaPath::SEPARATOR) {
                json_path.push_str(".\"");
                json_path.push_str(segment);
                json_path.push('"');
            }

            CountExpression {
                alias: raw.to_string(),
                json_path,
            }
        })
        .collect()
}

/// Metadata columns a caller may group by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Client,
    ClientVersion,
    DataCenter,
}

impl Dimension {
    /// Case-insensitive; snake_case and joined forms are both accepted
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "client" => Some(Dimension::Client),
            "client_version" | "clientversion" => Some(Dimension::ClientVersion),
            "data_center" | "datacenter" => Some(Dimension::DataCenter),
            _ => None,
        }
    }

    /// Column name in `query_events` (also the row key in results)
    pub fn column(&self) -> &'static str {
        match self {
            Dimension::Client => "client",
            Dimension::ClientVersion => "client_version",
            Dimension::DataCenter => "data_center",
        }
    }
}

/// Result shape requested from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
    Total,
    ByDay,
    ByDimensions(Vec<Dimension>),
}

impl Grouping {
    /// Row keys the store fills with the grouping values themselves
    pub fn row_keys(&self) -> Vec<&'static str> {
        match self {
            Grouping::Total => Vec::new(),
            Grouping::ByDay => vec![PROCESSED_DAY_KEY],
            Grouping::ByDimensions(dimensions) => dimensions.iter().map(Dimension::column).collect(),
        }
    }
}

/// Parse caller-supplied dimension names against the allow-list
///
/// Duplicates collapse to one column, first occurrence wins.
pub fn parse_dimensions(names: &[String]) -> AggregateResult<Vec<Dimension>> {
    if names.iter().all(|n| n.trim().is_empty()) {
        return Err(AggregateError::BadRequest(
            "Groupby params are mandatory".to_string(),
        ));
    }

    let mut dimensions = Vec::with_capacity(names.len());
    for name in names.iter().filter(|n| !n.trim().is_empty()) {
        let dimension = Dimension::parse(name).ok_or_else(|| {
            AggregateError::BadRequest(format!("Unknown group by dimension: {}", name))
        })?;
        if !dimensions.contains(&dimension) {
            dimensions.push(dimension);
        }
    }
    Ok(dimensions)
}

/// Turn a flat row into a nested object, splitting keys on `,`
///
/// When one key is a prefix of another (`deal` and `deal,price`), the nested
/// object wins regardless of key order.
pub fn reassemble(row: &FlatRow) -> Value {
    let mut root = Map::new();
    for (key, value) in row {
        let segments: Vec<&str> = key.split(SchemaPath::SEPARATOR).collect();
        insert_path(&mut root, &segments, value);
    }
    Value::Object(root)
}

pub fn reassemble_rows(rows: &[FlatRow]) -> Vec<Value> {
    rows.iter().map(reassemble).collect()
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], value: &Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let head = *head;

    if rest.is_empty() {
        match node.get(head) {
            Some(Value::Object(_)) => {}
            _ => {
                node.insert(head.to_string(), value.clone());
            }
        }
        return;
    }

    let child = node
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        insert_path(map, rest, value);
    }
}

/// Read side: counts over the current schema snapshot
pub struct AggregationService {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn QueryStore>,
}

impl AggregationService {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn QueryStore>) -> Self {
        Self { registry, store }
    }

    /// Totals across all stored queries as one nested object
    pub async fn get_total_counts(&self) -> AggregateResult<Value> {
        let snapshot = self.registry.current_snapshot();
        let rows = self.aggregate(&snapshot.paths, &Grouping::Total).await?;
        rows.first().map(reassemble).ok_or(AggregateError::NotFound)
    }

    /// One nested object per calendar day, oldest first
    pub async fn get_counts_by_day(&self) -> AggregateResult<Vec<Value>> {
        let snapshot = self.registry.current_snapshot();
        let rows = self.aggregate(&snapshot.paths, &Grouping::ByDay).await?;
        Ok(reassemble_rows(&rows))
    }

    /// One nested object per distinct tuple of the named dimensions
    pub async fn get_counts_by_dimensions(&self, names: &[String]) -> AggregateResult<Vec<Value>> {
        let dimensions = parse_dimensions(names)?;
        let snapshot = self.registry.current_snapshot();
        let rows = self
            .aggregate(&snapshot.paths, &Grouping::ByDimensions(dimensions))
            .await?;
        Ok(reassemble_rows(&rows))
    }

    /// Run one aggregation over `paths`
    ///
    /// No paths or no rows is `NotFound`; any store failure is `Internal`.
    pub async fn aggregate(
        &self,
        paths: &[SchemaPath],
        grouping: &Grouping,
    ) -> AggregateResult<Vec<FlatRow>> {
        if paths.is_empty() {
            log::debug!("No schema paths known, nothing to aggregate");
            return Err(AggregateError::NotFound);
        }

        // A top-level schema field named like a grouping key would overwrite it
        let row_keys = grouping.row_keys();
        let (expressions, shadowed): (Vec<_>, Vec<_>) = build_count_expressions(paths)
            .into_iter()
            .partition(|e| !row_keys.iter().any(|key| *key == e.alias));
        if !shadowed.is_empty() {
            log::warn!(
                "⚠️  Skipping schema paths that collide with {:?} result keys: {:?}",
                grouping,
                shadowed.iter().map(|e| e.alias.as_str()).collect::<Vec<_>>()
            );
        }

        let result = match grouping {
            Grouping::Total => self.store.count_by_paths(&expressions).await,
            Grouping::ByDay => self.store.count_by_paths_grouped_by_day(&expressions).await,
            Grouping::ByDimensions(dimensions) => {
                self.store
                    .count_by_paths_grouped_by(&expressions, dimensions)
                    .await
            }
        };

        let rows = result.map_err(|e| {
            log::error!("❌ Failed to get count ({:?}): {}", grouping, e);
            AggregateError::Internal
        })?;

        if rows.is_empty() {
            return Err(AggregateError::NotFound);
        }
        Ok(rows)
    }
}
