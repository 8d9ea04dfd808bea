//! Embedded SQLite store.
//!
//! The store exclusively owns the database connection and serialises access
//! behind an async mutex. It applies connection pragmas, keeps the internal
//! `versions` and `column_dictionary` tables, runs migrations, and exposes
//! the insert/query/delete path plus the maintenance primitives the vacuum
//! task needs. A connection found dead on use is reopened transparently with
//! pragmas re-applied.

pub mod column_dict;
pub mod migrations;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use column_dict::ColumnDictionary;

/// An ingested record: an open mapping from column name to JSON value.
pub type LogRecord = serde_json::Map<String, Value>;

/// Column descriptor as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Substring containment, compiled to `LIKE %value%`.
    Contains,
}

impl QueryOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            QueryOperator::Eq => "=",
            QueryOperator::Ne => "!=",
            QueryOperator::Gt => ">",
            QueryOperator::Ge => ">=",
            QueryOperator::Lt => "<",
            QueryOperator::Le => "<=",
            QueryOperator::Contains => "LIKE",
        }
    }
}

impl FromStr for QueryOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "=" => QueryOperator::Eq,
            "!=" => QueryOperator::Ne,
            ">" => QueryOperator::Gt,
            ">=" => QueryOperator::Ge,
            "<" => QueryOperator::Lt,
            "<=" => QueryOperator::Le,
            "~=" => QueryOperator::Contains,
            other => return Err(Error::Validation(format!("unknown operator: {other}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub field: String,
    pub operator: QueryOperator,
    pub value: Value,
}

/// Query result page. `total` counts every row matching the filters,
/// independent of paging.
#[derive(Debug, Serialize)]
pub struct PaginatedResult {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub results: Vec<LogRecord>,
}

#[derive(Debug, Clone, Copy)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn as_sql(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// True when `s` is safe to splice into SQL as an identifier.
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().enumerate().all(|(i, c)| {
            c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())
        })
}

struct StoreInner {
    conn: Option<Connection>,
    /// Column descriptors cached per migration epoch; cleared on rollback.
    columns: Vec<ColumnInfo>,
    dictionary: ColumnDictionary,
}

pub struct Store {
    db_path: PathBuf,
    table: String,
    timestamp_field: String,
    pragmas: BTreeMap<String, Value>,
    dict_columns: HashSet<String>,
    inner: Mutex<StoreInner>,
}

impl Store {
    pub fn new(config: &Config) -> Self {
        let dict_columns = if config.compression.enabled {
            config.compression.columns.iter().cloned().collect()
        } else {
            HashSet::new()
        };
        Self {
            db_path: config.db_path(),
            table: config.log_table_name.clone(),
            timestamp_field: config.log_timestamp_field.clone(),
            pragmas: config.sqlite_params.clone(),
            dict_columns,
            inner: Mutex::new(StoreInner {
                conn: None,
                columns: Vec::new(),
                dictionary: ColumnDictionary::default(),
            }),
        }
    }

    /// Ensure the internal tables exist and load the column-dictionary cache.
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = self.ensure_conn(&mut inner.conn)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS versions (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS column_dictionary (
                "column" TEXT NOT NULL,
                value TEXT NOT NULL,
                value_id INTEGER NOT NULL,
                UNIQUE("column", value)
            );
            "#,
        )?;
        inner.dictionary = ColumnDictionary::load(conn)?;
        Ok(())
    }

    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if guard.conn.take().is_some() {
            tracing::info!("closed connection to {}", self.db_path.display());
        }
    }

    pub async fn ping(&self) -> bool {
        let mut guard = self.inner.lock().await;
        match self.ensure_conn(&mut guard.conn) {
            Ok(conn) => match conn.query_row("SELECT 1", [], |_| Ok(())) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("failed to ping database: {e}");
                    false
                }
            },
            Err(e) => {
                tracing::error!("failed to ping database: {e}");
                false
            }
        }
    }

    pub async fn get_applied_versions(&self) -> Result<Vec<i64>> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let mut stmt = conn.prepare("SELECT version FROM versions ORDER BY version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(versions)
    }

    /// Apply a migration. Idempotent: an already-recorded version returns
    /// success without re-executing its statements.
    pub async fn apply_migration(&self, version: i64, statements: &[String]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let already: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM versions WHERE version = ?1)",
            [version],
            |row| row.get(0),
        )?;
        if already {
            tracing::info!("migration version {version} already applied");
            return Ok(());
        }

        let tx = conn.unchecked_transaction()?;
        for statement in statements {
            tx.execute_batch(statement)?;
        }
        tx.execute("INSERT INTO versions (version) VALUES (?1)", [version])?;
        tx.commit()?;
        tracing::info!("applied migration version {version}");
        Ok(())
    }

    /// Execute rollback statements, delete the version row, and invalidate
    /// the cached column descriptors.
    pub async fn rollback_migration(&self, version: i64, statements: &[String]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = self.ensure_conn(&mut inner.conn)?;
        let tx = conn.unchecked_transaction()?;
        for statement in statements {
            tx.execute_batch(statement)?;
        }
        tx.execute("DELETE FROM versions WHERE version = ?1", [version])?;
        tx.commit()?;
        inner.columns.clear();
        tracing::info!("rolled back migration version {version}");
        Ok(())
    }

    /// Current columns of the log table, cached until the next rollback.
    pub async fn get_log_columns(&self) -> Result<Vec<ColumnInfo>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = self.ensure_conn(&mut inner.conn)?;
        if inner.columns.is_empty() {
            inner.columns = read_columns(conn, &self.table)?;
        }
        Ok(inner.columns.clone())
    }

    pub async fn get_max_log_id(&self) -> Result<i64> {
        self.id_bound("MAX").await
    }

    pub async fn get_min_log_id(&self) -> Result<i64> {
        self.id_bound("MIN").await
    }

    async fn id_bound(&self, agg: &str) -> Result<i64> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let id: Option<i64> = conn.query_row(
            &format!("SELECT {agg}(id) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(id.unwrap_or(0))
    }

    /// Insert a batch of records inside a single transaction. Records
    /// missing a NOT NULL column are dropped with a warning and do not abort
    /// the rest of the batch. Returns the number of rows written.
    pub async fn insert(&self, records: &[LogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = self.ensure_conn(&mut inner.conn)?;
        if inner.columns.is_empty() {
            inner.columns = read_columns(conn, &self.table)?;
        }
        let columns: Vec<ColumnInfo> = inner
            .columns
            .iter()
            .filter(|c| c.name != "id")
            .cloned()
            .collect();

        let mut rows: Vec<Vec<SqlValue>> = Vec::with_capacity(records.len());
        'records: for record in records {
            let mut values = Vec::with_capacity(columns.len());
            for col in &columns {
                let value = record.get(&col.name);
                let missing = matches!(value, None | Some(Value::Null));
                if col.not_null && missing {
                    tracing::warn!(
                        "invalid log format, column {} is required but not present: {}",
                        col.name,
                        serde_json::Value::Object(record.clone())
                    );
                    continue 'records;
                }
                let encoded = match value {
                    Some(v) if !v.is_null() && self.dict_columns.contains(&col.name) => {
                        let key = dictionary_key(v);
                        // Dictionary rows are committed before the record
                        // batch; a failed batch never orphans cached ids.
                        SqlValue::Integer(inner.dictionary.get_or_create(conn, &col.name, &key)?)
                    }
                    other => encode_value(other),
                };
                values.push(encoded);
            }
            rows.push(values);
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.table,
            names.join(", ")
        );
        let tx = conn.unchecked_transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in &rows {
                written += stmt.execute(rusqlite::params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Query records matching the AND-joined filters, ordered by the
    /// timestamp column descending with id as tie-break. The total count is
    /// computed first; a zero total short-circuits the main query.
    pub async fn query(
        &self,
        fields: &[String],
        filters: &[QueryFilter],
        limit: u64,
        offset: u64,
    ) -> Result<PaginatedResult> {
        let select_list = compile_fields(fields)?;
        let (where_clause, params) = compile_filters(filters)?;
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {where_clause}", self.table),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        if total == 0 {
            return Ok(PaginatedResult { total, offset, limit, results: Vec::new() });
        }

        let sql = format!(
            "SELECT {select_list} FROM {} WHERE {where_clause} \
             ORDER BY {} DESC, id DESC LIMIT ? OFFSET ?",
            self.table, self.timestamp_field
        );
        let mut stmt = conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut all_params = params;
        all_params.push(SqlValue::Integer(limit as i64));
        all_params.push(SqlValue::Integer(offset as i64));

        let mut rows = stmt.query(rusqlite::params_from_iter(all_params.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = LogRecord::new();
            for (i, name) in column_names.iter().enumerate() {
                record.insert(name.clone(), decode_value(row.get_ref(i)?));
            }
            results.push(record);
        }
        Ok(PaginatedResult { total, offset, limit, results })
    }

    /// Records with id strictly above `after`, oldest first, bounded by
    /// `limit`. Serves the SSE catch-up path: because the page is a
    /// contiguous ascending run starting at `after`, advancing the cursor to
    /// the last returned id can never skip over unsent records, even when
    /// more than `limit` of them have accumulated.
    pub async fn query_after_id(&self, after: i64, limit: u64) -> Result<Vec<LogRecord>> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let sql = format!(
            "SELECT * FROM {} WHERE id > ? ORDER BY id ASC LIMIT ?",
            self.table
        );
        let mut stmt = conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params![after, limit as i64])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = LogRecord::new();
            for (i, name) in column_names.iter().enumerate() {
                record.insert(name.clone(), decode_value(row.get_ref(i)?));
            }
            results.push(record);
        }
        Ok(results)
    }

    /// Delete records matching the filters; returns the number removed.
    pub async fn delete(&self, filters: &[QueryFilter]) -> Result<usize> {
        let (where_clause, params) = compile_filters(filters)?;
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE {where_clause}", self.table),
            rusqlite::params_from_iter(params.iter()),
        )?;
        Ok(deleted)
    }

    /// Database size in megabytes, from `page_count × page_size`.
    pub async fn get_size_mb(&self) -> Result<f64> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count * page_size) as f64 / (1024.0 * 1024.0))
    }

    /// Read a single-valued pragma such as `freelist_count`.
    pub async fn get_pragma(&self, name: &str) -> Result<i64> {
        if !is_identifier(name) {
            return Err(Error::Validation(format!("invalid pragma name: {name}")));
        }
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let value = conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))?;
        Ok(value)
    }

    pub async fn wal_checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        conn.query_row(
            &format!("PRAGMA wal_checkpoint({})", mode.as_sql()),
            [],
            |_| Ok(()),
        )?;
        Ok(())
    }

    /// Free up to `pages` pages from the freelist (INCREMENTAL mode only).
    pub async fn incremental_vacuum(&self, pages: i64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let mut stmt = conn.prepare(&format!("PRAGMA incremental_vacuum({pages})"))?;
        let mut rows = stmt.query([])?;
        while rows.next()?.is_some() {}
        Ok(())
    }

    /// Full database compaction.
    pub async fn vacuum(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Persisted dictionary rows, for observability and tests.
    pub async fn column_dictionary_entries(&self) -> Result<Vec<(String, String, i64)>> {
        let mut guard = self.inner.lock().await;
        let conn = self.ensure_conn(&mut guard.conn)?;
        let mut stmt = conn.prepare(
            r#"SELECT "column", value, value_id FROM column_dictionary ORDER BY "column", value_id"#,
        )?;
        let entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Return the live connection, reopening it (and re-applying pragmas)
    /// when absent or no longer answering.
    fn ensure_conn<'a>(&self, slot: &'a mut Option<Connection>) -> Result<&'a Connection> {
        let conn = match slot.take() {
            Some(conn) => {
                if conn.query_row("SELECT 1", [], |_| Ok(())).is_ok() {
                    conn
                } else {
                    tracing::info!("reconnecting to {}", self.db_path.display());
                    self.connect()?
                }
            }
            None => self.connect()?,
        };
        Ok(slot.insert(conn))
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        for (name, value) in &self.pragmas {
            if !is_identifier(name) {
                tracing::warn!("skipping invalid sqlite parameter name: {name}");
                continue;
            }
            let rendered = pragma_value(value);
            tracing::debug!("PRAGMA {name}={rendered}");
            if let Err(e) = conn.pragma_update(None, name, &rendered) {
                tracing::error!("failed to set sqlite parameter {name}: {e}");
            }
        }
        tracing::info!("connected to {}", self.db_path.display());
        Ok(conn)
    }
}

fn pragma_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Scalars pass through, composites are stored as canonical JSON text.
fn encode_value(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(composite) => match serde_json::to_string(composite) {
            Ok(text) => SqlValue::Text(text),
            Err(_) => SqlValue::Null,
        },
    }
}

fn decode_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
    }
}

/// Key under which a value is interned: strings as-is, everything else in
/// its JSON rendering.
fn dictionary_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compile_fields(fields: &[String]) -> Result<String> {
    if fields.is_empty() || (fields.len() == 1 && fields[0] == "*") {
        return Ok("*".to_string());
    }
    for field in fields {
        if !is_identifier(field) {
            return Err(Error::Validation(format!("invalid field name: {field}")));
        }
    }
    Ok(fields.join(", "))
}

/// Compile AND-joined filters into a WHERE clause and its bound parameters.
/// Field names must be identifier-safe; values are always bound.
pub(crate) fn compile_filters(filters: &[QueryFilter]) -> Result<(String, Vec<SqlValue>)> {
    if filters.is_empty() {
        return Ok(("1=1".to_string(), Vec::new()));
    }
    let mut conditions = Vec::with_capacity(filters.len());
    let mut params = Vec::with_capacity(filters.len());
    for filter in filters {
        if !is_identifier(&filter.field) {
            return Err(Error::Validation(format!(
                "invalid filter field: {}",
                filter.field
            )));
        }
        match filter.operator {
            QueryOperator::Contains => {
                conditions.push(format!("{} LIKE ?", filter.field));
                params.push(SqlValue::Text(format!("%{}%", dictionary_key(&filter.value))));
            }
            op => {
                conditions.push(format!("{} {} ?", filter.field, op.as_sql()));
                params.push(encode_value(Some(&filter.value)));
            }
        }
    }
    Ok((conditions.join(" AND "), params))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Migration;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    pub(crate) const TABLE: &str = "test_logs";

    pub(crate) fn migration_v1() -> Migration {
        Migration {
            version: 1,
            rollout: vec![
                format!(
                    "CREATE TABLE {TABLE} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp TEXT NOT NULL,
                        level TEXT,
                        message TEXT,
                        source TEXT,
                        extra TEXT
                    )"
                ),
                format!("CREATE INDEX idx_{TABLE}_timestamp ON {TABLE}(timestamp)"),
            ],
            rollback: vec![
                format!("DROP INDEX idx_{TABLE}_timestamp"),
                format!("DROP TABLE {TABLE}"),
            ],
        }
    }

    pub(crate) fn test_config(dir: &Path) -> Config {
        Config {
            sqlite_dir: dir.to_path_buf(),
            log_table_name: TABLE.to_string(),
            migrations: vec![migration_v1()],
            sqlite_params: [
                ("journal_mode".to_string(), json!("WAL")),
                ("synchronous".to_string(), json!("NORMAL")),
            ]
            .into_iter()
            .collect(),
            ..Config::default()
        }
    }

    pub(crate) async fn migrated_store(dir: &Path) -> Store {
        let store = Store::new(&test_config(dir));
        store.initialize().await.unwrap();
        store
            .apply_migration(1, &migration_v1().rollout)
            .await
            .unwrap();
        store
    }

    pub(crate) fn rec(value: serde_json::Value) -> LogRecord {
        value.as_object().cloned().unwrap()
    }

    fn filter(field: &str, operator: QueryOperator, value: serde_json::Value) -> QueryFilter {
        QueryFilter { field: field.to_string(), operator, value }
    }

    #[tokio::test]
    async fn initialize_creates_internal_tables() {
        let dir = tempdir().unwrap();
        let store = Store::new(&test_config(dir.path()));
        store.initialize().await.unwrap();
        assert!(store.get_applied_versions().await.unwrap().is_empty());
        assert!(store.column_dictionary_entries().await.unwrap().is_empty());
        assert!(store.ping().await);
    }

    #[tokio::test]
    async fn apply_migration_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        assert_eq!(store.get_applied_versions().await.unwrap(), vec![1]);

        // Re-applying must succeed without executing the DDL again.
        store
            .apply_migration(1, &migration_v1().rollout)
            .await
            .unwrap();
        assert_eq!(store.get_applied_versions().await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn rollback_removes_version_and_invalidates_columns() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        let columns = store.get_log_columns().await.unwrap();
        assert!(columns.iter().any(|c| c.name == "timestamp"));

        store
            .rollback_migration(1, &migration_v1().rollback)
            .await
            .unwrap();
        assert!(store.get_applied_versions().await.unwrap().is_empty());
        // Table is gone, so the refreshed descriptor list is empty.
        assert!(store.get_log_columns().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_round_trip() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        let written = store
            .insert(&[rec(json!({
                "timestamp": "2024-01-01T00:00:00+00:00",
                "level": "INFO",
                "message": "Test log message",
                "source": "round_trip",
                "extra": {"key": "value"},
            }))])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let page = store.query(&[], &[], 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        let row = &page.results[0];
        assert_eq!(row["level"], json!("INFO"));
        assert_eq!(row["message"], json!("Test log message"));
        // Composite values come back as canonical JSON text.
        let extra: Value = serde_json::from_str(row["extra"].as_str().unwrap()).unwrap();
        assert_eq!(extra, json!({"key": "value"}));
    }

    #[tokio::test]
    async fn insert_assigns_strictly_increasing_ids() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        let mut last = 0;
        for i in 0..5 {
            store
                .insert(&[rec(json!({
                    "timestamp": format!("2024-01-01T00:00:0{i}+00:00"),
                    "message": format!("m{i}"),
                }))])
                .await
                .unwrap();
            let id = store.get_max_log_id().await.unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn insert_drops_records_missing_required_columns() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;

        // timestamp is NOT NULL; a record without it is dropped.
        let written = store
            .insert(&[rec(json!({"level": "INFO", "message": "incomplete"}))])
            .await
            .unwrap();
        assert_eq!(written, 0);

        // Invalid entries do not abort the rest of the batch.
        let written = store
            .insert(&[
                rec(json!({"timestamp": "2024-01-01T00:00:00+00:00", "message": "valid 1"})),
                rec(json!({"message": "invalid"})),
                rec(json!({"timestamp": "2024-01-01T00:00:01+00:00", "message": "valid 2"})),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        let page = store.query(&[], &[], 10, 0).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn query_pagination_is_ordered_and_total_is_stable() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        let records: Vec<LogRecord> = (0..5)
            .map(|i| {
                rec(json!({
                    // Msg 4 has the latest timestamp, Msg 0 the oldest.
                    "timestamp": format!("2024-01-01T00:00:0{i}+00:00"),
                    "message": format!("Msg {i}"),
                }))
            })
            .collect();
        assert_eq!(store.insert(&records).await.unwrap(), 5);

        let page = store.query(&[], &[], 2, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0]["message"], json!("Msg 2"));
        assert_eq!(page.results[1]["message"], json!("Msg 1"));

        // Offset beyond the result set yields an empty page, same total.
        let page = store.query(&[], &[], 2, 5).await.unwrap();
        assert_eq!(page.total, 5);
        assert!(page.results.is_empty());
    }

    #[tokio::test]
    async fn query_contains_filter_matches_substring() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        store
            .insert(&[
                rec(json!({"timestamp": "2024-01-01T00:00:00+00:00", "message": "hello"})),
                rec(json!({"timestamp": "2024-01-01T00:00:01+00:00", "message": "goodbye"})),
            ])
            .await
            .unwrap();

        let page = store
            .query(
                &[],
                &[filter("message", QueryOperator::Contains, json!("ell"))],
                100,
                0,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0]["message"], json!("hello"));
    }

    #[tokio::test]
    async fn query_after_id_pages_oldest_first_without_gaps() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        let records: Vec<LogRecord> = (0..5)
            .map(|i| {
                rec(json!({
                    "timestamp": format!("2024-01-01T00:00:0{i}+00:00"),
                    "message": format!("m{i}"),
                }))
            })
            .collect();
        store.insert(&records).await.unwrap();

        // More records above the cursor than the limit: the page is the
        // oldest contiguous run, so advancing the cursor to its last id
        // leaves the rest still fetchable.
        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let page = store.query_after_id(cursor, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            for row in &page {
                let id = row["id"].as_i64().unwrap();
                assert!(id > cursor);
                cursor = id;
                seen.push(row["message"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn query_rejects_unsafe_field_names() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        let err = store
            .query(
                &[],
                &[filter("message; DROP TABLE x", QueryOperator::Eq, json!("x"))],
                10,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        store
            .insert(&[
                rec(json!({"timestamp": "2024-01-01T00:00:00+00:00", "message": "keep"})),
                rec(json!({"timestamp": "2024-01-01T00:00:01+00:00", "message": "drop me"})),
            ])
            .await
            .unwrap();

        let filters = [filter("message", QueryOperator::Eq, json!("drop me"))];
        assert_eq!(store.delete(&filters).await.unwrap(), 1);
        assert_eq!(store.delete(&filters).await.unwrap(), 0);
        assert_eq!(store.query(&[], &[], 10, 0).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn dictionary_encoding_interns_configured_columns() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.compression.enabled = true;
        config.compression.columns = vec!["level".to_string()];
        let store = Store::new(&config);
        store.initialize().await.unwrap();
        store
            .apply_migration(1, &migration_v1().rollout)
            .await
            .unwrap();

        store
            .insert(&[
                rec(json!({"timestamp": "2024-01-01T00:00:00+00:00", "level": "INFO", "message": "a"})),
                rec(json!({"timestamp": "2024-01-01T00:00:01+00:00", "level": "INFO", "message": "b"})),
                rec(json!({"timestamp": "2024-01-01T00:00:02+00:00", "level": "WARN", "message": "c"})),
            ])
            .await
            .unwrap();

        let page = store.query(&[], &[], 10, 0).await.unwrap();
        let levels: Vec<&Value> = page.results.iter().map(|r| &r["level"]).collect();
        assert_eq!(levels, vec![&json!(2), &json!(1), &json!(1)]);

        let entries = store.column_dictionary_entries().await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("level".to_string(), "INFO".to_string(), 1),
                ("level".to_string(), "WARN".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn size_and_pragma_reporting() {
        let dir = tempdir().unwrap();
        let store = migrated_store(dir.path()).await;
        assert!(store.get_size_mb().await.unwrap() > 0.0);
        assert!(store.get_pragma("page_size").await.unwrap() > 0);
        assert!(store.get_pragma("page_count; --").await.is_err());
    }

    #[test]
    fn filter_compilation() {
        let (clause, params) = compile_filters(&[]).unwrap();
        assert_eq!(clause, "1=1");
        assert!(params.is_empty());

        let (clause, params) = compile_filters(&[
            filter("message", QueryOperator::Eq, json!("test")),
            filter("extra", QueryOperator::Ne, json!(null)),
        ])
        .unwrap();
        assert_eq!(clause, "message = ? AND extra != ?");
        assert_eq!(params.len(), 2);

        let (clause, params) =
            compile_filters(&[filter("message", QueryOperator::Contains, json!("test"))]).unwrap();
        assert_eq!(clause, "message LIKE ?");
        assert_eq!(params, vec![SqlValue::Text("%test%".to_string())]);
    }

    #[test]
    fn identifier_check() {
        assert!(is_identifier("timestamp"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("name; DROP"));
        assert!(!is_identifier(""));
    }
}
