//! PostgreSQL backend for the `EngineAdapter` trait.
//!
//! Filters, sorting and limits are pushed down as SQL; values are always
//! bound as typed parameters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

use crate::config::DatabaseBackend;
use crate::db::sql::{self, SqlParam, SqlStatement};
use crate::db::{EngineAdapter, SchemaCheck};
use crate::error::DataError;
use crate::query::{FilterCondition, QuerySpec};
use crate::record::{Record, Value};
use crate::schema::ddl::Dialect;
use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

/// PostgreSQL database backend.
///
/// The pool is built on first use and shared by every operation.
pub struct PgBackend {
    url: SecretString,
    pool_size: usize,
    pool: OnceCell<Pool>,
}

impl PgBackend {
    pub fn new(url: &str, pool_size: usize) -> Self {
        Self {
            url: SecretString::from(url.to_string()),
            pool_size,
            pool: OnceCell::new(),
        }
    }

    /// Get the connection pool, building it on first call.
    pub async fn pool(&self) -> Result<&Pool, DataError> {
        self.pool
            .get_or_try_init(|| async {
                let mut cfg = deadpool_postgres::Config::new();
                cfg.url = Some(self.url.expose_secret().to_string());
                cfg.manager = Some(ManagerConfig {
                    recycling_method: RecyclingMethod::Fast,
                });
                cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.pool_size));
                let pool = cfg
                    .create_pool(Some(Runtime::Tokio1), NoTls)
                    .map_err(|e| {
                        DataError::EngineUnavailable(format!("Failed to create pool: {}", e))
                    })?;
                tracing::info!("PostgreSQL pool ready (max {} connections)", self.pool_size);
                Ok(pool)
            })
            .await
    }

    async fn conn(&self) -> Result<Object, DataError> {
        Ok(self.pool().await?.get().await?)
    }

    async fn execute(&self, stmt: SqlStatement) -> Result<u64, DataError> {
        tracing::debug!(sql = %stmt.sql, "postgres execute");
        let conn = self.conn().await?;
        let boxed = boxed_params(stmt.params);
        Ok(conn.execute(&stmt.sql, &param_refs(&boxed)).await?)
    }
}

// ==================== Helper functions ====================

fn boxed_params(params: Vec<SqlParam>) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .into_iter()
        .map(|param| -> Box<dyn ToSql + Sync + Send> {
            match param {
                SqlParam::Text(v) => Box::new(v),
                SqlParam::Int(v) => Box::new(v),
                SqlParam::Bool(v) => Box::new(v),
                SqlParam::DateTime(v) => Box::new(v),
                SqlParam::Json(v) => Box::new(v),
            }
        })
        .collect()
}

fn param_refs(boxed: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn decode_row(row: &tokio_postgres::Row, fields: &[&FieldDescriptor]) -> Result<Record, DataError> {
    let mut record = Record::new();
    for (idx, field) in fields.iter().enumerate() {
        let value = match field.field_type {
            FieldType::String => row.try_get::<_, Option<String>>(idx)?.into(),
            FieldType::Int => row.try_get::<_, Option<i64>>(idx)?.into(),
            FieldType::Bool => row.try_get::<_, Option<bool>>(idx)?.into(),
            FieldType::DateTime => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.into(),
            FieldType::Json => match row.try_get::<_, Option<serde_json::Value>>(idx)? {
                Some(json) => Value::Json(json),
                None => Value::Null,
            },
        };
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

/// Errors a concurrent `CREATE ... IF NOT EXISTS` can still raise when two
/// callers race on the catalog.
fn is_already_exists(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(code) if *code == SqlState::DUPLICATE_TABLE
            || *code == SqlState::DUPLICATE_OBJECT
            || *code == SqlState::UNIQUE_VIOLATION
    )
}

async fn create_tolerating_races(conn: &Object, ddl: &str) -> Result<(), DataError> {
    tracing::debug!(sql = %ddl, "postgres ddl");
    match conn.batch_execute(ddl).await {
        Ok(()) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            tracing::debug!("Concurrent schema creation tolerated: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl EngineAdapter for PgBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    async fn ensure_schema(&self, schema: &SchemaDescriptor) -> Result<SchemaCheck, DataError> {
        let conn = self.conn().await?;
        create_tolerating_races(&conn, &Dialect::Postgres.create_table(schema)).await?;

        let rows = conn
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1",
                &[&schema.table_name],
            )
            .await?;
        let existing: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<_, _>>()?;
        let check = SchemaCheck::compare(schema, existing.iter().map(String::as_str));

        for ddl in check.creatable_indexes(schema, Dialect::Postgres) {
            create_tolerating_races(&conn, &ddl).await?;
        }
        Ok(check)
    }

    async fn insert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        self.execute(sql::insert(Dialect::Postgres, schema, record)?)
            .await?;
        Ok(())
    }

    async fn upsert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        self.execute(sql::upsert(Dialect::Postgres, schema, record)?)
            .await?;
        Ok(())
    }

    async fn find(
        &self,
        schema: &SchemaDescriptor,
        query: &QuerySpec,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError> {
        let stmt = sql::select(Dialect::Postgres, schema, query, limit)?;
        let fields = sql::selected_fields(schema, query.select.as_deref())?;
        tracing::debug!(sql = %stmt.sql, "postgres query");

        let conn = self.conn().await?;
        let boxed = boxed_params(stmt.params);
        let rows = conn.query(&stmt.sql, &param_refs(&boxed)).await?;
        rows.iter().map(|row| decode_row(row, &fields)).collect()
    }

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let stmt = sql::count(Dialect::Postgres, schema, conditions)?;
        tracing::debug!(sql = %stmt.sql, "postgres count");
        let conn = self.conn().await?;
        let boxed = boxed_params(stmt.params);
        let row = conn.query_one(&stmt.sql, &param_refs(&boxed)).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    async fn update_many(
        &self,
        schema: &SchemaDescriptor,
        partial: &Record,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        if partial.is_empty() {
            return self.count(schema, conditions).await;
        }
        // Postgres reports rows matched, including rows whose values did not
        // change.
        self.execute(sql::update(Dialect::Postgres, schema, partial, conditions)?)
            .await
    }

    async fn delete_many(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        self.execute(sql::delete(Dialect::Postgres, schema, conditions)?)
            .await
    }

    async fn ping(&self) -> Result<(), DataError> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}
