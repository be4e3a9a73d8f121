//! MySQL backend for the `EngineAdapter` trait, on an `sqlx` pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::mysql::{MySql, MySqlArguments, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Executor, Row};
use tokio::sync::OnceCell;

use crate::config::DatabaseBackend;
use crate::db::sql::{self, SqlParam, SqlStatement};
use crate::db::{EngineAdapter, SchemaCheck};
use crate::error::DataError;
use crate::query::{FilterCondition, QuerySpec};
use crate::record::{Record, Value};
use crate::schema::ddl::Dialect;
use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

/// `ER_TABLE_EXISTS_ERROR`
const ER_TABLE_EXISTS: u16 = 1050;
/// `ER_DUP_KEYNAME`: MySQL has no `CREATE INDEX IF NOT EXISTS`.
const ER_DUP_KEYNAME: u16 = 1061;

pub struct MySqlBackend {
    url: SecretString,
    pool_size: usize,
    pool: OnceCell<MySqlPool>,
}

impl MySqlBackend {
    pub fn new(url: &str, pool_size: usize) -> Self {
        Self {
            url: SecretString::from(url.to_string()),
            pool_size,
            pool: OnceCell::new(),
        }
    }

    pub async fn pool(&self) -> Result<&MySqlPool, DataError> {
        self.pool
            .get_or_try_init(|| async {
                let pool = MySqlPoolOptions::new()
                    .max_connections(u32::try_from(self.pool_size).unwrap_or(u32::MAX))
                    .connect(self.url.expose_secret())
                    .await
                    .map_err(|e| {
                        DataError::EngineUnavailable(format!("Failed to connect to MySQL: {}", e))
                    })?;
                tracing::info!("MySQL pool ready (max {} connections)", self.pool_size);
                Ok(pool)
            })
            .await
    }

    async fn execute(&self, stmt: &SqlStatement) -> Result<u64, DataError> {
        tracing::debug!(sql = %stmt.sql, "mysql execute");
        let pool = self.pool().await?;
        let result = bind_all(sqlx::query(&stmt.sql), &stmt.params)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_tolerating_races(&self, ddl: &str) -> Result<(), DataError> {
        tracing::debug!(sql = %ddl, "mysql ddl");
        let pool = self.pool().await?;
        match pool.execute(ddl).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                tracing::debug!("Concurrent schema creation tolerated: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ==================== Helper functions ====================

fn bind_all<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &[SqlParam],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param.clone() {
            SqlParam::Text(v) => query.bind(v),
            SqlParam::Int(v) => query.bind(v),
            SqlParam::Bool(v) => query.bind(v),
            SqlParam::DateTime(v) => query.bind(v),
            SqlParam::Json(v) => query.bind(v.map(Json)),
        };
    }
    query
}

fn is_already_exists(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|my| matches!(my.number(), ER_TABLE_EXISTS | ER_DUP_KEYNAME)),
        _ => false,
    }
}

fn decode_row(row: &MySqlRow, fields: &[&FieldDescriptor]) -> Result<Record, DataError> {
    let mut record = Record::new();
    for (idx, field) in fields.iter().enumerate() {
        let value = match field.field_type {
            FieldType::String => row.try_get::<Option<String>, _>(idx)?.into(),
            FieldType::Int => row.try_get::<Option<i64>, _>(idx)?.into(),
            FieldType::Bool => row.try_get::<Option<bool>, _>(idx)?.into(),
            FieldType::DateTime => row.try_get::<Option<DateTime<Utc>>, _>(idx)?.into(),
            FieldType::Json => match row.try_get::<Option<Json<serde_json::Value>>, _>(idx)? {
                Some(Json(json)) => Value::Json(json),
                None => Value::Null,
            },
        };
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

#[async_trait]
impl EngineAdapter for MySqlBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::MySql
    }

    async fn ensure_schema(&self, schema: &SchemaDescriptor) -> Result<SchemaCheck, DataError> {
        self.create_tolerating_races(&Dialect::MySql.create_table(schema))
            .await?;

        let pool = self.pool().await?;
        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT CAST(COLUMN_NAME AS CHAR) FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(schema.table_name.as_str())
        .fetch_all(pool)
        .await?;
        let check = SchemaCheck::compare(schema, existing.iter().map(String::as_str));

        for ddl in check.creatable_indexes(schema, Dialect::MySql) {
            self.create_tolerating_races(&ddl).await?;
        }
        Ok(check)
    }

    async fn insert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        self.execute(&sql::insert(Dialect::MySql, schema, record)?)
            .await?;
        Ok(())
    }

    /// `ON DUPLICATE KEY UPDATE` would fire on any unique key, so the row is
    /// locked by id first and then replaced or inserted. A clash on another
    /// unique constraint surfaces as `DuplicateKey` from the insert or update.
    async fn upsert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        let id = record
            .id()
            .ok_or_else(|| DataError::Validation("record has no 'id'".to_string()))?;
        let lock = sql::lock_by_id(Dialect::MySql, schema, id)?;
        tracing::debug!(sql = %lock.sql, "mysql upsert lock");

        let mut tx = self.pool().await?.begin().await?;
        let existing = bind_all(sqlx::query(&lock.sql), &lock.params)
            .fetch_optional(&mut *tx)
            .await?;
        let write = match existing {
            Some(_) => sql::replace(Dialect::MySql, schema, record)?,
            None => Some(sql::insert(Dialect::MySql, schema, record)?),
        };
        if let Some(stmt) = write {
            tracing::debug!(sql = %stmt.sql, "mysql upsert write");
            bind_all(sqlx::query(&stmt.sql), &stmt.params)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find(
        &self,
        schema: &SchemaDescriptor,
        query: &QuerySpec,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError> {
        let stmt = sql::select(Dialect::MySql, schema, query, limit)?;
        let fields = sql::selected_fields(schema, query.select.as_deref())?;
        tracing::debug!(sql = %stmt.sql, "mysql query");

        let pool = self.pool().await?;
        let rows = bind_all(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_all(pool)
            .await?;
        rows.iter().map(|row| decode_row(row, &fields)).collect()
    }

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let stmt = sql::count(Dialect::MySql, schema, conditions)?;
        tracing::debug!(sql = %stmt.sql, "mysql count");
        let pool = self.pool().await?;
        let row = bind_all(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_one(pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    /// MySQL reports changed rows, not matched rows, so the match count is
    /// taken inside the same transaction as the update.
    async fn update_many(
        &self,
        schema: &SchemaDescriptor,
        partial: &Record,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        if partial.is_empty() {
            return self.count(schema, conditions).await;
        }
        let count_stmt = sql::count(Dialect::MySql, schema, conditions)?;
        let update_stmt = sql::update(Dialect::MySql, schema, partial, conditions)?;
        tracing::debug!(sql = %update_stmt.sql, "mysql update");

        let mut tx = self.pool().await?.begin().await?;
        let row = bind_all(sqlx::query(&count_stmt.sql), &count_stmt.params)
            .fetch_one(&mut *tx)
            .await?;
        let matched: i64 = row.try_get(0)?;
        bind_all(sqlx::query(&update_stmt.sql), &update_stmt.params)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(matched as u64)
    }

    async fn delete_many(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        self.execute(&sql::delete(Dialect::MySql, schema, conditions)?)
            .await
    }

    async fn ping(&self) -> Result<(), DataError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok(())
    }
}
