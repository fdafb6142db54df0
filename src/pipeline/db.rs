//! Store contract and its SQLite implementation
//!
//! Tables (see `/sql/`):
//! - `query_events` - INSERT only, one row per validated query event
//! - `parsed_schema_events` - INSERT only, one row per schema path per generation
//!
//! Count queries are assembled from `CountExpression`s built by the
//! aggregation module. JSON paths are always bound as parameters and group-by
//! columns come from the `Dimension` allow-list, so no caller-supplied text is
//! ever spliced into SQL.

use super::aggregation::{CountExpression, Dimension, PROCESSED_DAY_KEY};
use super::types::{FlatRow, QueryRecord, SchemaPath};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Repository contract consumed by the pipeline and the aggregation service
#[async_trait]
pub trait QueryStore: Send + Sync {
    /// Append one query event row
    async fn insert_query_record(&self, record: QueryRecord) -> Result<(), StoreError>;

    /// Append the paths of one schema generation (document order kept)
    async fn insert_schema_paths(
        &self,
        generation: u64,
        paths: &[SchemaPath],
    ) -> Result<(), StoreError>;

    /// Paths of the newest persisted generation, if any
    async fn latest_schema_paths(&self) -> Result<Option<(u64, Vec<SchemaPath>)>, StoreError>;

    /// Ungrouped totals: one row, or no rows when nothing is stored
    async fn count_by_paths(
        &self,
        expressions: &[CountExpression],
    ) -> Result<Vec<FlatRow>, StoreError>;

    /// One row per calendar day of `processed_time`
    async fn count_by_paths_grouped_by_day(
        &self,
        expressions: &[CountExpression],
    ) -> Result<Vec<FlatRow>, StoreError>;

    /// One row per distinct tuple of the given metadata dimensions
    async fn count_by_paths_grouped_by(
        &self,
        expressions: &[CountExpression],
        dimensions: &[Dimension],
    ) -> Result<Vec<FlatRow>, StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir`, sorted by name (00_, 01_, ...),
/// and executes them. Every file must use `IF NOT EXISTS` so the loader is
/// idempotent.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::SchemaDirNotFound(schema_dir.to_string()));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// SQLite implementation of `QueryStore`
pub struct SqliteQueryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueryStore {
    /// Open a store on an existing database
    ///
    /// Does NOT create tables. Run `run_schema_migrations` first.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Migrate `db_path` from `schema_dir`, then open the store on it
    pub fn open_migrated(db_path: &str, schema_dir: &str) -> Result<Self, StoreError> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        drop(conn);
        Self::new(db_path)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Number of stored query events
    pub fn query_record_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM query_events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Stored query payloads in insertion order
    pub fn stored_queries(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT query FROM query_events ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>().map_err(StoreError::from)
    }
}

/// `COUNT(json_extract(query, ?N))` for each expression, comma-joined
fn count_columns(expressions: &[CountExpression]) -> String {
    (1..=expressions.len())
        .map(|i| format!("COUNT(json_extract(query, ?{}))", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Prefix `columns` with `, ` when non-empty
fn trailing(columns: &str) -> String {
    if columns.is_empty() {
        String::new()
    } else {
        format!(", {}", columns)
    }
}

/// Read the count columns starting at `offset` into `row_out`, keyed by alias
fn read_counts(
    row: &Row<'_>,
    offset: usize,
    expressions: &[CountExpression],
    row_out: &mut FlatRow,
) -> rusqlite::Result<()> {
    for (i, expr) in expressions.iter().enumerate() {
        let count: i64 = row.get(offset + i)?;
        row_out.insert(expr.alias.clone(), Value::from(count));
    }
    Ok(())
}

fn text_or_null(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

#[async_trait]
impl QueryStore for SqliteQueryStore {
    async fn insert_query_record(&self, record: QueryRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO query_events (
                client, client_version, data_center, processed_time, query
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.client,
                record.client_version,
                record.data_center,
                record
                    .processed_time
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                record.query,
            ],
        )?;
        Ok(())
    }

    async fn insert_schema_paths(
        &self,
        generation: u64,
        paths: &[SchemaPath],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let tx = conn.transaction()?;
        for (position, path) in paths.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO parsed_schema_events (generation, position, schema_path, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![generation as i64, position as i64, path.as_str(), created_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn latest_schema_paths(&self) -> Result<Option<(u64, Vec<SchemaPath>)>, StoreError> {
        let conn = self.conn()?;

        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(generation) FROM parsed_schema_events",
            [],
            |row| row.get(0),
        )?;

        let Some(generation) = latest else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT schema_path FROM parsed_schema_events
             WHERE generation = ?1
             ORDER BY position ASC",
        )?;
        let paths = stmt
            .query_map([generation], |row| row.get::<_, String>(0))?
            .map(|r| r.map(SchemaPath::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some((generation as u64, paths)))
    }

    async fn count_by_paths(
        &self,
        expressions: &[CountExpression],
    ) -> Result<Vec<FlatRow>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT COUNT(*){} FROM query_events",
            trailing(&count_columns(expressions))
        );

        let (total, row) = conn.query_row(
            &sql,
            params_from_iter(expressions.iter().map(|e| e.json_path.as_str())),
            |row| {
                let total: i64 = row.get(0)?;
                let mut flat = FlatRow::new();
                read_counts(row, 1, expressions, &mut flat)?;
                Ok((total, flat))
            },
        )?;

        // COUNT always yields a row; an empty table is "no result"
        if total == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![row])
    }

    async fn count_by_paths_grouped_by_day(
        &self,
        expressions: &[CountExpression],
    ) -> Result<Vec<FlatRow>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT date(processed_time) AS day{} FROM query_events GROUP BY day ORDER BY day",
            trailing(&count_columns(expressions))
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(expressions.iter().map(|e| e.json_path.as_str())),
            |row| {
                let mut flat = FlatRow::new();
                flat.insert(PROCESSED_DAY_KEY.to_string(), text_or_null(row.get(0)?));
                read_counts(row, 1, expressions, &mut flat)?;
                Ok(flat)
            },
        )?;

        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    async fn count_by_paths_grouped_by(
        &self,
        expressions: &[CountExpression],
        dimensions: &[Dimension],
    ) -> Result<Vec<FlatRow>, StoreError> {
        let conn = self.conn()?;
        let group_columns = dimensions
            .iter()
            .map(|d| d.column())
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "SELECT {group}{counts} FROM query_events GROUP BY {group} ORDER BY {group}",
            group = group_columns,
            counts = trailing(&count_columns(expressions))
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(expressions.iter().map(|e| e.json_path.as_str())),
            |row| {
                let mut flat = FlatRow::new();
                for (i, dimension) in dimensions.iter().enumerate() {
                    flat.insert(dimension.column().to_string(), text_or_null(row.get(i)?));
                }
                read_counts(row, dimensions.len(), expressions, &mut flat)?;
                Ok(flat)
            },
        )?;

        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::aggregation::build_count_expressions;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use tempfile::NamedTempFile;

    /// Helper to create a migrated test database
    pub(crate) fn create_test_store() -> (NamedTempFile, Arc<SqliteQueryStore>) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let store = SqliteQueryStore::open_migrated(db_path, "sql").unwrap();
        (temp_file, Arc::new(store))
    }

    /// Store that fails every call (connectivity loss)
    pub(crate) struct FailingStore;

    #[async_trait]
    impl QueryStore for FailingStore {
        async fn insert_query_record(&self, _record: QueryRecord) -> Result<(), StoreError> {
            Err(StoreError::LockPoisoned)
        }

        async fn insert_schema_paths(
            &self,
            _generation: u64,
            _paths: &[SchemaPath],
        ) -> Result<(), StoreError> {
            Err(StoreError::LockPoisoned)
        }

        async fn latest_schema_paths(
            &self,
        ) -> Result<Option<(u64, Vec<SchemaPath>)>, StoreError> {
            Err(StoreError::LockPoisoned)
        }

        async fn count_by_paths(
            &self,
            _expressions: &[CountExpression],
        ) -> Result<Vec<FlatRow>, StoreError> {
            Err(StoreError::LockPoisoned)
        }

        async fn count_by_paths_grouped_by_day(
            &self,
            _expressions: &[CountExpression],
        ) -> Result<Vec<FlatRow>, StoreError> {
            Err(StoreError::LockPoisoned)
        }

        async fn count_by_paths_grouped_by(
            &self,
            _expressions: &[CountExpression],
            _dimensions: &[Dimension],
        ) -> Result<Vec<FlatRow>, StoreError> {
            Err(StoreError::LockPoisoned)
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 5, day, hour, 0, 0).unwrap()
    }

    fn expressions(paths: &[&str]) -> Vec<CountExpression> {
        let paths: Vec<SchemaPath> = paths.iter().map(|p| SchemaPath::from(*p)).collect();
        build_count_expressions(&paths)
    }

    #[tokio::test]
    async fn test_insert_query_record() {
        let (_temp, store) = create_test_store();
        let record = QueryRecord::new(r#"{"deal":{"price":true}}"#, at(10, 12));

        store.insert_query_record(record).await.unwrap();

        let conn = store.conn.lock().unwrap();
        let result: (String, String, String, String, String) = conn
            .query_row(
                "SELECT client, client_version, data_center, processed_time, query FROM query_events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .unwrap();

        assert_eq!(result.0, "client_id");
        assert_eq!(result.1, "v1");
        assert_eq!(result.2, "Google");
        assert_eq!(result.3, "2022-05-10T12:00:00.000Z");
        assert_eq!(result.4, r#"{"deal":{"price":true}}"#);
    }

    #[tokio::test]
    async fn test_table_rejects_invalid_json() {
        // Validation happens before the store; the CHECK constraint is the backstop
        let (_temp, store) = create_test_store();
        let result = store
            .insert_query_record(QueryRecord::new(r#"{"incomplete": "#, at(10, 12)))
            .await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(store.query_record_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_schema_generation_wins() {
        let (_temp, store) = create_test_store();
        assert!(store.latest_schema_paths().await.unwrap().is_none());

        let gen1: Vec<SchemaPath> = vec!["a,b".into(), "a,c".into()];
        let gen2: Vec<SchemaPath> = vec!["z".into(), "y,x".into(), "a,b".into()];
        store.insert_schema_paths(1, &gen1).await.unwrap();
        store.insert_schema_paths(2, &gen2).await.unwrap();

        let (generation, paths) = store.latest_schema_paths().await.unwrap().unwrap();
        assert_eq!(generation, 2);
        assert_eq!(paths, gen2);
    }

    #[tokio::test]
    async fn test_count_by_paths_empty_table_has_no_rows() {
        let (_temp, store) = create_test_store();
        let rows = store
            .count_by_paths(&expressions(&["deal,price"]))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_count_by_paths_counts_present_fields() {
        let (_temp, store) = create_test_store();
        for q in [
            r#"{"deal":{"price":true}}"#,
            r#"{"deal":{"title":true,"price":true}}"#,
            r#"{"user":{"name":true}}"#,
        ] {
            store.insert_query_record(QueryRecord::new(q, at(10, 9))).await.unwrap();
        }

        let rows = store
            .count_by_paths(&expressions(&["query,deal", "deal,title", "deal,price", "user,name"]))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["query,deal"], 2);
        assert_eq!(row["deal,title"], 1);
        assert_eq!(row["deal,price"], 2);
        assert_eq!(row["user,name"], 1);
    }

    #[tokio::test]
    async fn test_grouped_by_day_merges_same_day_only() {
        let (_temp, store) = create_test_store();
        store
            .insert_query_record(QueryRecord::new(r#"{"deal":{"price":true}}"#, at(10, 1)))
            .await
            .unwrap();
        store
            .insert_query_record(QueryRecord::new(r#"{"deal":{"price":true}}"#, at(10, 23)))
            .await
            .unwrap();
        store
            .insert_query_record(QueryRecord::new(r#"{"deal":{"title":true}}"#, at(11, 0)))
            .await
            .unwrap();

        let rows = store
            .count_by_paths_grouped_by_day(&expressions(&["deal,price", "deal,title"]))
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][PROCESSED_DAY_KEY], "2022-05-10");
        assert_eq!(rows[0]["deal,price"], 2);
        assert_eq!(rows[0]["deal,title"], 0);
        assert_eq!(rows[1][PROCESSED_DAY_KEY], "2022-05-11");
        assert_eq!(rows[1]["deal,price"], 0);
        assert_eq!(rows[1]["deal,title"], 1);
    }

    #[tokio::test]
    async fn test_grouped_by_dimensions() {
        let (_temp, store) = create_test_store();
        let mut other = QueryRecord::new(r#"{"deal":{"price":true}}"#, at(10, 1));
        other.client = "other_client".to_string();
        store.insert_query_record(other).await.unwrap();
        store
            .insert_query_record(QueryRecord::new(r#"{"deal":{"price":true}}"#, at(10, 2)))
            .await
            .unwrap();
        store
            .insert_query_record(QueryRecord::new(r#"{"deal":{}}"#, at(10, 3)))
            .await
            .unwrap();

        let rows = store
            .count_by_paths_grouped_by(
                &expressions(&["deal,price"]),
                &[Dimension::Client, Dimension::DataCenter],
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["client"], "client_id");
        assert_eq!(rows[0]["data_center"], "Google");
        assert_eq!(rows[0]["deal,price"], 1);
        assert_eq!(rows[1]["client"], "other_client");
        assert_eq!(rows[1]["deal,price"], 1);
    }

    #[tokio::test]
    async fn test_json_path_is_bound_not_spliced() {
        // A hostile schema key ends up inside a bound parameter, not the SQL text
        let (_temp, store) = create_test_store();
        store
            .insert_query_record(QueryRecord::new(r#"{"deal":{"price":true}}"#, at(10, 1)))
            .await
            .unwrap();

        let rows = store
            .count_by_paths(&expressions(&["deal,price') FROM query_events; DROP TABLE query_events; --"]))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(store.query_record_count().unwrap(), 1);
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = run_schema_migrations(&mut conn, "does/not/exist");
        assert!(matches!(result, Err(StoreError::SchemaDirNotFound(_))));
    }
}
