//! Embedded single-file store on libSQL (Turso's SQLite fork).
//!
//! Rows live in typed columns, one table per descriptor. Reads scan the
//! whole table and filter/sort in process with [`crate::query::eval`], so
//! results match the other engines exactly; writes resolve the matching ids
//! first and then touch only those rows.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use tokio::sync::OnceCell;

use crate::config::DatabaseBackend;
use crate::db::sql::{self, SqlParam, SqlStatement};
use crate::db::{EngineAdapter, SchemaCheck};
use crate::error::DataError;
use crate::query::{FilterCondition, QuerySpec, eval};
use crate::record::{Record, Value};
use crate::schema::ddl::Dialect;
use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

/// Ids per `WHERE id IN (...)` batch, well under SQLite's variable limit.
const ID_BATCH: usize = 500;

/// libSQL embedded backend.
///
/// The database file (and its parent directory) is created on first use.
pub struct LibSqlBackend {
    path: PathBuf,
    db: OnceCell<LibSqlDatabase>,
}

impl LibSqlBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn database(&self) -> Result<&LibSqlDatabase, DataError> {
        self.db
            .get_or_try_init(|| async {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DataError::EngineUnavailable(format!(
                            "Failed to create database directory: {}",
                            e
                        ))
                    })?;
                }
                let db = libsql::Builder::new_local(&self.path)
                    .build()
                    .await
                    .map_err(|e| {
                        DataError::EngineUnavailable(format!(
                            "Failed to open libSQL database: {}",
                            e
                        ))
                    })?;
                let conn = db.connect().map_err(|e| {
                    DataError::EngineUnavailable(format!("Failed to create connection: {}", e))
                })?;
                conn.query("PRAGMA journal_mode = WAL", ()).await?;
                tracing::info!("Opened embedded database at {}", self.path.display());
                Ok(db)
            })
            .await
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait instead of failing with "database is locked".
    pub async fn connect(&self) -> Result<Connection, DataError> {
        let conn = self.database().await?.connect().map_err(|e| {
            DataError::EngineUnavailable(format!("Failed to create connection: {}", e))
        })?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| {
                DataError::EngineUnavailable(format!("Failed to set busy_timeout: {}", e))
            })?;
        Ok(conn)
    }

    async fn execute(&self, conn: &Connection, stmt: SqlStatement) -> Result<u64, DataError> {
        tracing::debug!(sql = %stmt.sql, "libsql execute");
        let params: Vec<libsql::Value> = stmt.params.into_iter().map(to_libsql).collect();
        Ok(conn.execute(&stmt.sql, params).await?)
    }

    /// Every row of the table, decoded against the descriptor.
    async fn scan(&self, schema: &SchemaDescriptor) -> Result<Vec<Record>, DataError> {
        let conn = self.connect().await?;
        let stmt = sql::select(Dialect::Sqlite, schema, &QuerySpec::new(), None)?;
        tracing::debug!(sql = %stmt.sql, "libsql scan");
        let mut rows = conn.query(&stmt.sql, ()).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(decode_row(&row, &schema.fields)?);
        }
        Ok(records)
    }

    async fn matching_ids(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<Vec<String>, DataError> {
        Ok(self
            .scan(schema)
            .await?
            .iter()
            .filter(|r| eval::matches_all(r, conditions))
            .filter_map(|r| r.id().map(str::to_string))
            .collect())
    }
}

// ==================== Helper functions ====================

/// Parse a timestamp column.
///
/// Accepts RFC 3339 (the write format) and SQLite's naive
/// `YYYY-MM-DD HH:MM:SS[.fff]` output.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// RFC 3339 with millisecond precision, so text order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn to_libsql(param: SqlParam) -> libsql::Value {
    match param {
        SqlParam::Text(Some(s)) => libsql::Value::Text(s),
        SqlParam::Int(Some(i)) => libsql::Value::Integer(i),
        SqlParam::Bool(Some(b)) => libsql::Value::Integer(i64::from(b)),
        SqlParam::DateTime(Some(dt)) => libsql::Value::Text(fmt_ts(&dt)),
        SqlParam::Json(Some(v)) => libsql::Value::Text(v.to_string()),
        SqlParam::Text(None)
        | SqlParam::Int(None)
        | SqlParam::Bool(None)
        | SqlParam::DateTime(None)
        | SqlParam::Json(None) => libsql::Value::Null,
    }
}

fn decode_value(raw: libsql::Value, field: &FieldDescriptor) -> Result<Value, DataError> {
    let corrupt = |detail: String| {
        DataError::Serialization(format!("column '{}': {}", field.name, detail))
    };
    Ok(match (field.field_type, raw) {
        (_, libsql::Value::Null) => Value::Null,
        (FieldType::String, libsql::Value::Text(s)) => Value::Text(s),
        (FieldType::String, libsql::Value::Integer(i)) => Value::Text(i.to_string()),
        (FieldType::Int, libsql::Value::Integer(i)) => Value::Int(i),
        (FieldType::Int, libsql::Value::Real(f)) => Value::Float(f),
        (FieldType::Bool, libsql::Value::Integer(i)) => Value::Bool(i != 0),
        (FieldType::DateTime, libsql::Value::Text(s)) => {
            Value::DateTime(parse_timestamp(&s).map_err(corrupt)?)
        }
        (FieldType::Json, libsql::Value::Text(s)) => {
            Value::Json(serde_json::from_str(&s).map_err(|e| corrupt(e.to_string()))?)
        }
        (field_type, other) => {
            return Err(corrupt(format!(
                "unexpected {:?} for a {} column",
                other,
                field_type.as_str()
            )));
        }
    })
}

fn decode_row(row: &libsql::Row, fields: &[FieldDescriptor]) -> Result<Record, DataError> {
    let mut record = Record::new();
    for (idx, field) in fields.iter().enumerate() {
        let raw = row.get_value(idx as i32)?;
        record.insert(field.name.clone(), decode_value(raw, field)?);
    }
    Ok(record)
}

#[async_trait]
impl EngineAdapter for LibSqlBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Embedded
    }

    async fn ensure_schema(&self, schema: &SchemaDescriptor) -> Result<SchemaCheck, DataError> {
        let conn = self.connect().await?;
        conn.execute(&Dialect::Sqlite.create_table(schema), ())
            .await?;

        let pragma = format!(
            "PRAGMA table_info({})",
            Dialect::Sqlite.quote(&schema.table_name)
        );
        let mut rows = conn.query(&pragma, ()).await?;
        let mut existing = Vec::new();
        while let Some(row) = rows.next().await? {
            existing.push(row.get::<String>(1)?);
        }
        drop(rows);
        let check = SchemaCheck::compare(schema, existing.iter().map(String::as_str));

        for ddl in check.creatable_indexes(schema, Dialect::Sqlite) {
            conn.execute(&ddl, ()).await?;
        }
        Ok(check)
    }

    async fn insert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        let conn = self.connect().await?;
        self.execute(&conn, sql::insert(Dialect::Sqlite, schema, record)?)
            .await?;
        Ok(())
    }

    async fn upsert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        let conn = self.connect().await?;
        self.execute(&conn, sql::upsert(Dialect::Sqlite, schema, record)?)
            .await?;
        Ok(())
    }

    async fn find(
        &self,
        schema: &SchemaDescriptor,
        query: &QuerySpec,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError> {
        let records = self.scan(schema).await?;
        Ok(eval::apply(records, query, limit))
    }

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let records = self.scan(schema).await?;
        Ok(records
            .iter()
            .filter(|r| eval::matches_all(r, conditions))
            .count() as u64)
    }

    async fn update_many(
        &self,
        schema: &SchemaDescriptor,
        partial: &Record,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let ids = self.matching_ids(schema, conditions).await?;
        if ids.is_empty() || partial.is_empty() {
            return Ok(ids.len() as u64);
        }
        let conn = self.connect().await?;
        for batch in ids.chunks(ID_BATCH) {
            let by_ids = [FilterCondition::is_in("id", batch.iter().cloned())];
            self.execute(&conn, sql::update(Dialect::Sqlite, schema, partial, &by_ids)?)
                .await?;
        }
        Ok(ids.len() as u64)
    }

    async fn delete_many(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let ids = self.matching_ids(schema, conditions).await?;
        let conn = self.connect().await?;
        let mut deleted = 0;
        for batch in ids.chunks(ID_BATCH) {
            let by_ids = [FilterCondition::is_in("id", batch.iter().cloned())];
            deleted += self
                .execute(&conn, sql::delete(Dialect::Sqlite, schema, &by_ids)?)
                .await?;
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), DataError> {
        let conn = self.connect().await?;
        let mut rows = conn.query("SELECT 1", ()).await?;
        rows.next().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::{LibSqlBackend, parse_timestamp};
    use crate::db::EngineAdapter;
    use crate::error::DataError;
    use crate::query::{FilterCondition, QuerySpec, SortSpec};
    use crate::record::{Record, Value};
    use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

    struct TestBackend {
        backend: LibSqlBackend,
        _tmpdir: tempfile::TempDir,
    }

    fn test_backend() -> TestBackend {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LibSqlBackend::new(dir.path().join("nested").join("store.db"));
        TestBackend {
            backend,
            _tmpdir: dir,
        }
    }

    fn items() -> SchemaDescriptor {
        SchemaDescriptor::new("items")
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("name", FieldType::String).nullable())
            .field(FieldDescriptor::new("x", FieldType::Int))
            .field(FieldDescriptor::new("active", FieldType::Bool))
            .field(FieldDescriptor::new("tags", FieldType::Json).nullable())
            .field(FieldDescriptor::new("createdAt", FieldType::DateTime))
            .unique(["name"])
    }

    fn item(i: i64) -> Record {
        Record::new()
            .with("id", format!("r{i}"))
            .with("name", format!("item-{i}"))
            .with("x", i)
            .with("active", i % 2 == 0)
            .with("tags", serde_json::json!(["a", i]))
            .with(
                "createdAt",
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, i as u32).unwrap(),
            )
    }

    async fn seeded() -> TestBackend {
        let t = test_backend();
        let schema = items();
        t.backend.ensure_schema(&schema).await.expect("schema");
        for i in 1..=10 {
            t.backend.insert(&schema, &item(i)).await.expect("insert");
        }
        t
    }

    #[tokio::test]
    async fn creates_file_and_parent_directory_on_first_use() {
        let t = test_backend();
        assert!(!t.backend.path().exists());
        let check = t.backend.ensure_schema(&items()).await.expect("schema");
        assert!(check.is_clean());
        assert!(t.backend.path().exists());
    }

    #[tokio::test]
    async fn busy_timeout_set_on_connect() {
        let t = test_backend();
        let conn = t.backend.connect().await.expect("connect");
        let mut rows = conn.query("PRAGMA busy_timeout", ()).await.expect("pragma");
        let row = rows.next().await.expect("row").expect("some row");
        let timeout: i64 = row.get(0).expect("value");
        assert_eq!(timeout, 5000);
    }

    #[tokio::test]
    async fn typed_columns_round_trip() {
        let t = seeded().await;
        let found = t
            .backend
            .find(&items(), &QuerySpec::by_id("r4"), None)
            .await
            .expect("find");
        assert_eq!(found, vec![item(4)]);
    }

    #[tokio::test]
    async fn gte_filter_and_sort_run_in_process() {
        let t = seeded().await;
        let query = QuerySpec::new()
            .filter(FilterCondition::gte("x", 5))
            .order_by(SortSpec::desc("x"))
            .select(["id"]);
        let found = t.backend.find(&items(), &query, None).await.expect("find");
        let ids: Vec<&str> = found.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["r10", "r9", "r8", "r7", "r6", "r5"]);
        assert_eq!(found[0].len(), 1);
    }

    #[tokio::test]
    async fn update_many_reports_matched_rows() {
        let t = seeded().await;
        let schema = items();
        let partial = Record::new().with("name", Value::Null);
        let modified = t
            .backend
            .update_many(&schema, &partial, &[FilterCondition::lte("x", 3)])
            .await
            .expect("update");
        assert_eq!(modified, 3);
        let nulls = t
            .backend
            .count(&schema, &[FilterCondition::eq("name", Value::Null)])
            .await
            .expect("count");
        assert_eq!(nulls, 3);
    }

    #[tokio::test]
    async fn delete_many_with_no_match_removes_nothing() {
        let t = seeded().await;
        let schema = items();
        let deleted = t
            .backend
            .delete_many(&schema, &[FilterCondition::gt("x", 100)])
            .await
            .expect("delete");
        assert_eq!(deleted, 0);
        let deleted = t
            .backend
            .delete_many(&schema, &[FilterCondition::is_in("id", ["r1", "r2", "nope"])])
            .await
            .expect("delete");
        assert_eq!(deleted, 2);
        assert_eq!(t.backend.count(&schema, &[]).await.expect("count"), 8);
    }

    #[tokio::test]
    async fn duplicate_id_and_unique_field_are_duplicate_key() {
        let t = seeded().await;
        let schema = items();
        let err = t.backend.insert(&schema, &item(1)).await.expect_err("dup id");
        assert!(matches!(err, DataError::DuplicateKey(_)), "{err:?}");

        let clash = item(11).with("name", "item-2");
        let err = t.backend.insert(&schema, &clash).await.expect_err("dup name");
        assert!(matches!(err, DataError::DuplicateKey(_)), "{err:?}");
    }

    #[tokio::test]
    async fn upsert_replaces_the_whole_row() {
        let t = seeded().await;
        let schema = items();
        let replacement = item(3).with("x", 300).with("tags", Value::Null);
        t.backend.upsert(&schema, &replacement).await.expect("upsert");
        let found = t
            .backend
            .find(&schema, &QuerySpec::by_id("r3"), None)
            .await
            .expect("find");
        assert_eq!(found, vec![replacement]);
        assert_eq!(t.backend.count(&schema, &[]).await.expect("count"), 10);
    }

    #[tokio::test]
    async fn ensure_schema_reports_columns_missing_from_existing_table() {
        let t = test_backend();
        let narrow = SchemaDescriptor::new("items")
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("x", FieldType::Int));
        t.backend.ensure_schema(&narrow).await.expect("narrow");
        let check = t.backend.ensure_schema(&items()).await.expect("wide");
        assert_eq!(
            check.missing_columns,
            vec!["name", "active", "tags", "createdAt"]
        );
    }

    #[tokio::test]
    async fn concurrent_ensure_schema_is_tolerated() {
        let t = test_backend();
        let schema = items();
        let results = futures::future::join_all(
            (0..8).map(|_| t.backend.ensure_schema(&schema)),
        )
        .await;
        for result in results {
            assert!(result.expect("ensure_schema").is_clean());
        }
        let conn = t.backend.connect().await.expect("connect");
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'items'",
                (),
            )
            .await
            .expect("query");
        let row = rows.next().await.expect("row").expect("some row");
        assert_eq!(row.get::<i64>(0).expect("count"), 1);
    }

    #[test]
    fn parses_sqlite_naive_timestamps() {
        let dt = parse_timestamp("2024-01-15 10:30:00").expect("naive");
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
