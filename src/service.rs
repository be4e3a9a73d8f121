//! The universal data service: the one facade callers use for persistence.
//!
//! Construct one instance at startup (see [`UniversalDataService::from_config`])
//! and share it behind an `Arc`. Every call resolves the table's registered
//! descriptor, validates its input against it, then hands off to the engine
//! adapter selected from configuration.

use std::sync::Arc;

use crate::config::{DatabaseBackend, DatabaseConfig, SchemaConflictPolicy};
use crate::db::{EngineAdapter, MutationResult, connect_from_config};
use crate::error::DataError;
use crate::query::{FilterCondition, QuerySpec, validate_conditions};
use crate::record::{Record, Value};
use crate::schema::{FieldType, SchemaDescriptor, SchemaRegistry};

/// Result of [`UniversalDataService::apply_sort_order`].
///
/// Each id is written by its own update with no surrounding transaction, so
/// a failure part-way through leaves earlier ids already renumbered.
#[derive(Debug, Default)]
pub struct SortOrderOutcome {
    /// Ids whose position was written.
    pub applied: Vec<String>,
    /// Ids that matched no record.
    pub missing: Vec<String>,
    /// Ids whose update failed, with the error.
    pub failures: Vec<(String, DataError)>,
}

impl SortOrderOutcome {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.failures.is_empty()
    }
}

pub struct UniversalDataService {
    adapter: Arc<dyn EngineAdapter>,
    registry: SchemaRegistry,
    conflict_policy: SchemaConflictPolicy,
}

impl std::fmt::Debug for UniversalDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalDataService")
            .field("backend", &self.adapter.backend())
            .field("tables", &self.registry.table_names())
            .field("conflict_policy", &self.conflict_policy)
            .finish()
    }
}

impl UniversalDataService {
    pub fn new(adapter: Arc<dyn EngineAdapter>) -> Self {
        Self {
            adapter,
            registry: SchemaRegistry::new(),
            conflict_policy: SchemaConflictPolicy::default(),
        }
    }

    pub fn with_conflict_policy(mut self, policy: SchemaConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Build the service for the configured engine. Fails only for engines
    /// that are not compiled in or lack a URL; connections open lazily.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, DataError> {
        let adapter = connect_from_config(config)?;
        Ok(Self::new(adapter).with_conflict_policy(config.schema_conflict_policy))
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.adapter.backend()
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Check that the engine is reachable.
    pub async fn ping(&self) -> Result<(), DataError> {
        self.adapter.ping().await
    }

    // ==================== Schema ====================

    /// Create the table/collection for `descriptor` if needed and register
    /// it. Safe to call repeatedly and concurrently.
    pub async fn ensure_schema(
        &self,
        descriptor: SchemaDescriptor,
    ) -> Result<Arc<SchemaDescriptor>, DataError> {
        descriptor.validate()?;
        if let Some(existing) = self.registry.get(&descriptor.table_name)
            && *existing == descriptor
        {
            return Ok(existing);
        }

        let check = self.adapter.ensure_schema(&descriptor).await?;
        if !check.is_clean() {
            let message = format!(
                "existing table lacks declared columns: {}",
                check.missing_columns.join(", ")
            );
            match self.conflict_policy {
                SchemaConflictPolicy::Warn => {
                    tracing::warn!("Schema conflict on '{}': {}", descriptor.table_name, message);
                }
                SchemaConflictPolicy::Strict => {
                    return Err(DataError::SchemaConflict {
                        table: descriptor.table_name,
                        message,
                    });
                }
            }
        }

        let registration = self.registry.register(descriptor);
        if registration.shape_mismatch {
            tracing::warn!(
                "Table '{}' is already registered with a different shape; keeping the first",
                registration.descriptor.table_name
            );
        } else {
            tracing::debug!("Schema ready: {}", registration.descriptor.table_name);
        }
        Ok(registration.descriptor)
    }

    fn schema(&self, table: &str) -> Result<Arc<SchemaDescriptor>, DataError> {
        self.registry.get(table).ok_or_else(|| {
            DataError::Validation(format!(
                "no schema registered for table '{table}'; call ensure_schema first"
            ))
        })
    }

    // ==================== Writes ====================

    /// Insert a new record. An existing `id` is `DuplicateKey`.
    pub async fn insert(&self, table: &str, record: Record) -> Result<MutationResult, DataError> {
        let schema = self.schema(table)?;
        schema.validate_record(&record)?;
        self.adapter.insert(&schema, &record).await?;
        Ok(MutationResult::modified(1))
    }

    /// Insert, or replace the whole record with the same `id`.
    pub async fn upsert(&self, table: &str, record: Record) -> Result<MutationResult, DataError> {
        let schema = self.schema(table)?;
        schema.validate_record(&record)?;
        self.adapter.upsert(&schema, &record).await?;
        Ok(MutationResult::modified(1))
    }

    /// Replace the fields in `partial` on the record with `id`. A missing id
    /// is `modified_count: 0`, not an error.
    pub async fn update(
        &self,
        table: &str,
        id: &str,
        mut partial: Record,
    ) -> Result<MutationResult, DataError> {
        let schema = self.schema(table)?;
        match partial.remove("id") {
            None => {}
            Some(Value::Text(ref same)) if same == id => {}
            Some(other) => {
                return Err(DataError::Validation(format!(
                    "cannot change id of '{id}' to {:?}",
                    other
                )));
            }
        }
        schema.validate_partial(&partial)?;
        let modified = self
            .adapter
            .update_many(&schema, &partial, &[FilterCondition::eq("id", id)])
            .await?;
        Ok(MutationResult::modified(modified))
    }

    /// Replace the fields in `partial` on every record matching `query`.
    /// Only `query.conditions` is used.
    pub async fn update_many(
        &self,
        table: &str,
        partial: Record,
        query: &QuerySpec,
    ) -> Result<MutationResult, DataError> {
        let schema = self.schema(table)?;
        if partial.contains("id") {
            return Err(DataError::Validation(
                "update_many cannot change 'id'".to_string(),
            ));
        }
        schema.validate_partial(&partial)?;
        validate_conditions(&query.conditions, Some(&schema))?;
        let modified = self
            .adapter
            .update_many(&schema, &partial, &query.conditions)
            .await?;
        Ok(MutationResult::modified(modified))
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<MutationResult, DataError> {
        let schema = self.schema(table)?;
        let deleted = self
            .adapter
            .delete_many(&schema, &[FilterCondition::eq("id", id)])
            .await?;
        Ok(MutationResult::deleted(deleted))
    }

    pub async fn delete_many(
        &self,
        table: &str,
        query: &QuerySpec,
    ) -> Result<MutationResult, DataError> {
        let schema = self.schema(table)?;
        validate_conditions(&query.conditions, Some(&schema))?;
        let deleted = self.adapter.delete_many(&schema, &query.conditions).await?;
        Ok(MutationResult::deleted(deleted))
    }

    /// Write each id's list position into `field`, one independent update per
    /// id. Failures do not stop the remaining updates and nothing is rolled
    /// back; the outcome lists what happened to every id.
    pub async fn apply_sort_order(
        &self,
        table: &str,
        field: &str,
        ids: &[String],
    ) -> Result<SortOrderOutcome, DataError> {
        let schema = self.schema(table)?;
        let descriptor = schema.require_field(field)?;
        if descriptor.field_type != FieldType::Int || field == "id" {
            return Err(DataError::Validation(format!(
                "sort order field '{field}' must be a non-key int field"
            )));
        }

        let mut outcome = SortOrderOutcome::default();
        for (position, id) in ids.iter().enumerate() {
            let partial = Record::new().with(field, position as i64);
            match self.update(table, id, partial).await {
                Ok(result) if result.modified_count > 0 => outcome.applied.push(id.clone()),
                Ok(_) => outcome.missing.push(id.clone()),
                Err(e) => {
                    tracing::warn!("Sort order update failed for {}/{}: {}", table, id, e);
                    outcome.failures.push((id.clone(), e));
                }
            }
        }
        Ok(outcome)
    }

    // ==================== Reads ====================

    /// First match in query order, or `None`.
    pub async fn find_one(
        &self,
        table: &str,
        query: &QuerySpec,
    ) -> Result<Option<Record>, DataError> {
        let schema = self.schema(table)?;
        query.validate(Some(&schema))?;
        let mut found = self.adapter.find(&schema, query, Some(1)).await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Every match in query order. Empty is not an error.
    pub async fn find_many(&self, table: &str, query: &QuerySpec) -> Result<Vec<Record>, DataError> {
        let schema = self.schema(table)?;
        query.validate(Some(&schema))?;
        self.adapter.find(&schema, query, None).await
    }

    pub async fn count(&self, table: &str, query: &QuerySpec) -> Result<u64, DataError> {
        let schema = self.schema(table)?;
        validate_conditions(&query.conditions, Some(&schema))?;
        self.adapter.count(&schema, &query.conditions).await
    }
}
