//! Database abstraction layer.
//!
//! Provides a backend-agnostic `EngineAdapter` trait that executes the
//! filter DSL against one storage engine. Four implementations exist behind
//! feature flags:
//!
//! - `libsql`: embedded single-file store (libSQL local database)
//! - `mongodb`: document store
//! - `postgres`: `deadpool-postgres` + `tokio-postgres`
//! - `mysql`: `sqlx` MySQL pool
//!
//! Callers never talk to an adapter directly; they go through
//! [`crate::service::UniversalDataService`], which validates input against
//! the registered descriptor first.

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "mongodb")]
pub mod mongo;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(any(feature = "postgres", feature = "mysql", feature = "libsql"))]
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DataError;
use crate::query::{FilterCondition, QuerySpec};
use crate::record::Record;
use crate::schema::SchemaDescriptor;

/// Outcome of creating (or finding) a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCheck {
    /// Declared columns the existing table does not have.
    pub missing_columns: Vec<String>,
}

impl SchemaCheck {
    pub fn clean() -> Self {
        Self::default()
    }

    /// Compare declared columns against the columns the engine reports.
    pub fn compare<'a, I>(schema: &SchemaDescriptor, existing: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let existing: Vec<&str> = existing.into_iter().collect();
        Self {
            missing_columns: schema
                .column_names()
                .filter(|name| !existing.iter().any(|e| e == name))
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.missing_columns.is_empty()
    }

    /// Unique index statements whose columns all exist. Constraints over a
    /// missing column are skipped; the column is already reported.
    #[cfg(any(feature = "postgres", feature = "mysql", feature = "libsql"))]
    pub fn creatable_indexes(
        &self,
        schema: &SchemaDescriptor,
        dialect: crate::schema::ddl::Dialect,
    ) -> Vec<String> {
        schema
            .unique_constraints
            .iter()
            .zip(dialect.create_unique_indexes(schema))
            .filter(|(columns, _)| {
                columns
                    .iter()
                    .all(|c| !self.missing_columns.iter().any(|m| m == c))
            })
            .map(|(_, ddl)| ddl)
            .collect()
    }
}

/// Result of a write operation, in the shape callers already consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub success: bool,
    /// Rows matched by the update filter.
    pub modified_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
}

impl MutationResult {
    pub fn modified(count: u64) -> Self {
        Self {
            success: true,
            modified_count: count,
            deleted_count: None,
        }
    }

    pub fn deleted(count: u64) -> Self {
        Self {
            success: true,
            modified_count: 0,
            deleted_count: Some(count),
        }
    }
}

/// One storage engine.
///
/// Arguments are validated by the facade before they reach an adapter:
/// records and partials match the descriptor and every referenced field is
/// declared. Adapters own connection setup, which happens lazily on first
/// use and is memoized.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn backend(&self) -> DatabaseBackend;

    /// Create the table/collection and its unique indexes if absent, then
    /// report declared columns the existing table lacks.
    async fn ensure_schema(&self, schema: &SchemaDescriptor) -> Result<SchemaCheck, DataError>;

    /// Insert a new record. An existing `id` is `DuplicateKey`.
    async fn insert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError>;

    /// Insert, or fully replace the record with the same `id`.
    async fn upsert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError>;

    /// Matching records in query order, at most `limit` of them.
    async fn find(
        &self,
        schema: &SchemaDescriptor,
        query: &QuerySpec,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError>;

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError>;

    /// Apply `partial` to every match. Returns the number of rows matched.
    async fn update_many(
        &self,
        schema: &SchemaDescriptor,
        partial: &Record,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError>;

    /// Returns the number of rows removed.
    async fn delete_many(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError>;

    /// Round-trip to the engine.
    async fn ping(&self) -> Result<(), DataError>;
}

/// Create the adapter for the configured engine.
///
/// No connection is opened here; adapters connect on first use, so this
/// only fails for engines that were not compiled in or lack a URL.
pub fn connect_from_config(config: &DatabaseConfig) -> Result<Arc<dyn EngineAdapter>, DataError> {
    tracing::info!("Using {} storage engine", config.backend);
    match config.backend {
        #[cfg(feature = "libsql")]
        DatabaseBackend::Embedded => Ok(Arc::new(libsql::LibSqlBackend::new(
            config.embedded_path.clone(),
        ))),
        #[cfg(feature = "mongodb")]
        DatabaseBackend::Document => {
            let url = config.require_url()?;
            Ok(Arc::new(mongo::MongoBackend::new(
                url,
                &config.mongodb_database,
                config.pool_size,
            )))
        }
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => {
            let url = config.require_url()?;
            Ok(Arc::new(postgres::PgBackend::new(url, config.pool_size)))
        }
        #[cfg(feature = "mysql")]
        DatabaseBackend::MySql => {
            let url = config.require_url()?;
            Ok(Arc::new(mysql::MySqlBackend::new(url, config.pool_size)))
        }
        #[allow(unreachable_patterns)]
        other => Err(DataError::UnsupportedEngine(format!(
            "{other} support was not compiled into this build"
        ))),
    }
}
