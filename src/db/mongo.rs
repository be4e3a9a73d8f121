//! Document store backend for the `EngineAdapter` trait.
//!
//! Collections need no setup, so `ensure_schema` creates nothing. Equality
//! and `in` conditions are pushed down as `$eq`/`$ne`/`$in`; range operators
//! are evaluated in process after retrieval, the same way the embedded store
//! does it. Sorting is server-side.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;

use crate::config::DatabaseBackend;
use crate::db::{EngineAdapter, SchemaCheck};
use crate::error::DataError;
use crate::query::{FilterCondition, Operator, QuerySpec, SortDirection, eval};
use crate::record::{Record, Value};
use crate::schema::{FieldType, SchemaDescriptor};

/// Primary key of every document. It carries the record id so the server's
/// own unique index rejects duplicate ids. Never exposed to callers.
const MONGO_ID: &str = "_id";

pub struct MongoBackend {
    url: SecretString,
    database: String,
    pool_size: usize,
    client: OnceCell<Client>,
}

impl MongoBackend {
    pub fn new(url: &str, database: &str, pool_size: usize) -> Self {
        Self {
            url: SecretString::from(url.to_string()),
            database: database.to_string(),
            pool_size,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, DataError> {
        self.client
            .get_or_try_init(|| async {
                let mut options = ClientOptions::parse(self.url.expose_secret())
                    .await
                    .map_err(|e| {
                        DataError::EngineUnavailable(format!("Invalid MongoDB URL: {}", e))
                    })?;
                options.max_pool_size = Some(u32::try_from(self.pool_size).unwrap_or(u32::MAX));
                let client = Client::with_options(options)?;
                tracing::info!("MongoDB client ready (database '{}')", self.database);
                Ok(client)
            })
            .await
    }

    async fn collection(&self, schema: &SchemaDescriptor) -> Result<Collection<Document>, DataError> {
        Ok(self
            .client()
            .await?
            .database(&self.database)
            .collection::<Document>(&schema.table_name))
    }

    /// Documents matching the pushed-down part of `conditions`, optionally
    /// sorted server-side.
    async fn fetch(
        &self,
        schema: &SchemaDescriptor,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> Result<Vec<Record>, DataError> {
        tracing::debug!(filter = %filter, "mongodb find");
        let collection = self.collection(schema).await?;
        let mut find = collection.find(filter);
        if let Some(sort) = sort {
            find = find.sort(sort);
        }
        if let Some(limit) = limit {
            find = find.limit(limit);
        }
        let docs: Vec<Document> = find.await?.try_collect().await?;
        docs.into_iter()
            .map(|doc| document_to_record(doc, schema))
            .collect()
    }

    /// Ids of every document matching all `conditions`.
    async fn matching_ids(
        &self,
        schema: &SchemaDescriptor,
        plan: &FilterPlan,
    ) -> Result<Vec<String>, DataError> {
        let records = self.fetch(schema, plan.pushdown.clone(), None, None).await?;
        Ok(records
            .iter()
            .filter(|r| eval::matches_all(r, &plan.in_process))
            .filter_map(|r| r.id().map(str::to_string))
            .collect())
    }
}

// ==================== Translation ====================

/// Split of a condition list into what the server evaluates and what is
/// checked after retrieval.
#[derive(Debug)]
struct FilterPlan {
    pushdown: Document,
    in_process: Vec<FilterCondition>,
}

impl FilterPlan {
    fn is_pushed_down(&self) -> bool {
        self.in_process.is_empty()
    }
}

fn plan_filter(
    schema: &SchemaDescriptor,
    conditions: &[FilterCondition],
) -> Result<FilterPlan, DataError> {
    let mut clauses = Vec::new();
    let mut in_process = Vec::new();
    for condition in conditions {
        let field_type = schema.require_field(&condition.field)?.field_type;
        let values = condition.value.values();
        let op = match condition.operator {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::In => "$in",
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                in_process.push(condition.clone());
                continue;
            }
        };
        let operand = match condition.operator {
            Operator::In => Bson::Array(
                values
                    .iter()
                    .map(|v| to_bson(v, field_type))
                    .collect::<Result<_, _>>()?,
            ),
            _ => match values.first() {
                Some(value) => to_bson(value, field_type)?,
                None => Bson::Null,
            },
        };
        let mut clause = Document::new();
        clause.insert(condition.field.clone(), doc! { op: operand });
        clauses.push(Bson::Document(clause));
    }
    let pushdown = match clauses.len() {
        0 => Document::new(),
        1 => match clauses.pop() {
            Some(Bson::Document(single)) => single,
            _ => Document::new(),
        },
        _ => doc! { "$and": clauses },
    };
    Ok(FilterPlan {
        pushdown,
        in_process,
    })
}

fn sort_document(query: &QuerySpec) -> Option<Document> {
    if query.order_by.is_empty() {
        return None;
    }
    let mut sort = Document::new();
    for spec in &query.order_by {
        let direction = match spec.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        sort.insert(spec.field.clone(), direction);
    }
    Some(sort)
}

/// Convert a value for storage in, or comparison against, a field of
/// `field_type`.
fn to_bson(value: &Value, field_type: FieldType) -> Result<Bson, DataError> {
    Ok(match (field_type, value) {
        (_, Value::Null) => Bson::Null,
        (FieldType::DateTime, Value::Text(raw)) => match chrono::DateTime::parse_from_rfc3339(raw)
        {
            Ok(dt) => Bson::DateTime(bson::DateTime::from_millis(dt.timestamp_millis())),
            Err(_) => Bson::String(raw.clone()),
        },
        (FieldType::Int, Value::Float(f)) if f.fract() == 0.0 => Bson::Int64(*f as i64),
        (_, Value::Bool(b)) => Bson::Boolean(*b),
        (_, Value::Int(i)) => Bson::Int64(*i),
        (_, Value::Float(f)) => Bson::Double(*f),
        (_, Value::Text(s)) => Bson::String(s.clone()),
        (_, Value::DateTime(dt)) => Bson::DateTime(bson::DateTime::from_millis(dt.timestamp_millis())),
        (_, Value::Json(json)) => {
            bson::to_bson(json).map_err(|e| DataError::Serialization(e.to_string()))?
        }
    })
}

fn from_bson(raw: Bson, field_type: FieldType) -> Value {
    match (field_type, raw) {
        (_, Bson::Null | Bson::Undefined) => Value::Null,
        (FieldType::Json, other) => Value::Json(other.into_relaxed_extjson()),
        (FieldType::Int, Bson::Double(f)) if f.fract() == 0.0 => Value::Int(f as i64),
        (_, Bson::Boolean(b)) => Value::Bool(b),
        (_, Bson::Int32(i)) => Value::Int(i64::from(i)),
        (_, Bson::Int64(i)) => Value::Int(i),
        (_, Bson::Double(f)) => Value::Float(f),
        (_, Bson::String(s)) => Value::Text(s),
        (_, Bson::DateTime(dt)) => match Utc.timestamp_millis_opt(dt.timestamp_millis()).single() {
            Some(dt) => Value::DateTime(dt),
            None => Value::Null,
        },
        (_, Bson::ObjectId(oid)) => Value::Text(oid.to_hex()),
        (_, other) => Value::Json(other.into_relaxed_extjson()),
    }
}

fn record_to_document(record: &Record, schema: &SchemaDescriptor) -> Result<Document, DataError> {
    let mut doc = Document::new();
    for (name, value) in record.iter() {
        let field_type = schema.require_field(name)?.field_type;
        doc.insert(name.clone(), to_bson(value, field_type)?);
    }
    Ok(doc)
}

/// A whole record as stored: the fields plus `_id` set to the record id.
fn keyed_document(record: &Record, schema: &SchemaDescriptor) -> Result<Document, DataError> {
    let id = record
        .id()
        .ok_or_else(|| DataError::Validation("record has no 'id'".to_string()))?;
    let mut doc = record_to_document(record, schema)?;
    doc.insert(MONGO_ID, id);
    Ok(doc)
}

/// Declared fields only, with absent fields filled in as `Null` so rows look
/// the same as on the column stores.
fn document_to_record(mut doc: Document, schema: &SchemaDescriptor) -> Result<Record, DataError> {
    doc.remove(MONGO_ID);
    let mut record = Record::new();
    for field in &schema.fields {
        let value = match doc.remove(&field.name) {
            Some(raw) => from_bson(raw, field.field_type),
            None => Value::Null,
        };
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

fn id_filter(ids: &[String]) -> Document {
    doc! { "id": { "$in": ids.iter().map(|id| Bson::String(id.clone())).collect::<Vec<_>>() } }
}

#[async_trait]
impl EngineAdapter for MongoBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Document
    }

    async fn ensure_schema(&self, _schema: &SchemaDescriptor) -> Result<SchemaCheck, DataError> {
        Ok(SchemaCheck::clean())
    }

    async fn insert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        // A second insert of the same id fails on `_id` with code 11000.
        let doc = keyed_document(record, schema)?;
        self.collection(schema).await?.insert_one(doc).await?;
        Ok(())
    }

    async fn upsert(&self, schema: &SchemaDescriptor, record: &Record) -> Result<(), DataError> {
        let doc = keyed_document(record, schema)?;
        let filter = doc! { "_id": record.id() };
        self.collection(schema)
            .await?
            .replace_one(filter, doc)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn find(
        &self,
        schema: &SchemaDescriptor,
        query: &QuerySpec,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError> {
        let plan = plan_filter(schema, &query.conditions)?;
        // A server-side limit is only safe when nothing is filtered after
        // retrieval.
        let server_limit = match (plan.is_pushed_down(), limit) {
            (true, Some(n)) => Some(i64::try_from(n).unwrap_or(i64::MAX)),
            _ => None,
        };
        let mut records = self
            .fetch(schema, plan.pushdown.clone(), sort_document(query), server_limit)
            .await?;
        records.retain(|r| eval::matches_all(r, &plan.in_process));
        if let Some(n) = limit {
            records.truncate(n);
        }
        if let Some(select) = &query.select {
            records = records.into_iter().map(|r| r.project(select)).collect();
        }
        Ok(records)
    }

    async fn count(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let plan = plan_filter(schema, conditions)?;
        if plan.is_pushed_down() {
            let collection = self.collection(schema).await?;
            return Ok(collection.count_documents(plan.pushdown).await?);
        }
        Ok(self.matching_ids(schema, &plan).await?.len() as u64)
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
        let plan = plan_filter(schema, conditions)?;
        let filter = if plan.is_pushed_down() {
            plan.pushdown.clone()
        } else {
            let ids = self.matching_ids(schema, &plan).await?;
            if ids.is_empty() {
                return Ok(0);
            }
            id_filter(&ids)
        };
        let update = doc! { "$set": record_to_document(partial, schema)? };
        tracing::debug!(filter = %filter, "mongodb update_many");
        let collection = self.collection(schema).await?;
        let result = collection.update_many(filter, update).await?;
        Ok(result.matched_count)
    }

    async fn delete_many(
        &self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<u64, DataError> {
        let plan = plan_filter(schema, conditions)?;
        let filter = if plan.is_pushed_down() {
            plan.pushdown.clone()
        } else {
            let ids = self.matching_ids(schema, &plan).await?;
            if ids.is_empty() {
                return Ok(0);
            }
            id_filter(&ids)
        };
        tracing::debug!(filter = %filter, "mongodb delete_many");
        let collection = self.collection(schema).await?;
        let result = collection.delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn ping(&self) -> Result<(), DataError> {
        self.client()
            .await?
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mongodb::bson::{Bson, doc};
    use pretty_assertions::assert_eq;

    use super::{MONGO_ID, document_to_record, keyed_document, plan_filter, record_to_document, sort_document};
    use crate::error::DataError;
    use crate::query::{FilterCondition, QuerySpec, SortSpec};
    use crate::record::{Record, Value};
    use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

    fn items() -> SchemaDescriptor {
        SchemaDescriptor::new("items")
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("name", FieldType::String).nullable())
            .field(FieldDescriptor::new("x", FieldType::Int))
            .field(FieldDescriptor::new("tags", FieldType::Json).nullable())
            .field(FieldDescriptor::new("createdAt", FieldType::DateTime))
    }

    #[test]
    fn equality_and_in_are_pushed_down() {
        let conditions = vec![
            FilterCondition::eq("name", Value::Null),
            FilterCondition::ne("x", 3),
            FilterCondition::is_in("id", ["a", "b"]),
        ];
        let plan = plan_filter(&items(), &conditions).expect("plan");
        assert!(plan.is_pushed_down());
        assert_eq!(
            plan.pushdown,
            doc! { "$and": [
                { "name": { "$eq": Bson::Null } },
                { "x": { "$ne": 3_i64 } },
                { "id": { "$in": ["a", "b"] } },
            ] }
        );
    }

    #[test]
    fn range_conditions_stay_in_process() {
        let conditions = vec![
            FilterCondition::gte("x", 5),
            FilterCondition::eq("id", "r5"),
        ];
        let plan = plan_filter(&items(), &conditions).expect("plan");
        assert_eq!(plan.pushdown, doc! { "id": { "$eq": "r5" } });
        assert_eq!(plan.in_process.len(), 1);
        assert_eq!(plan.in_process[0].field, "x");
    }

    #[test]
    fn sort_keeps_priority_order() {
        let query = QuerySpec::new()
            .order_by(SortSpec::desc("x"))
            .order_by(SortSpec::asc("name"));
        let sort = sort_document(&query).expect("sort");
        let keys: Vec<&str> = sort.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["x", "name"]);
        assert_eq!(sort.get_i32("x").expect("x"), -1);
        assert!(sort_document(&QuerySpec::new()).is_none());
    }

    #[test]
    fn documents_convert_to_records_without_driver_id() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let record = Record::new()
            .with("id", "r1")
            .with("x", 4)
            .with("tags", serde_json::json!(["a", "b"]))
            .with("createdAt", created);
        let mut doc = keyed_document(&record, &items()).expect("to doc");
        assert_eq!(doc.get_str(MONGO_ID).expect("_id"), "r1");
        doc.insert("legacy", "dropped");

        let back = document_to_record(doc, &items()).expect("to record");
        assert_eq!(back, record.with("name", Value::Null));
    }

    #[test]
    fn partial_documents_never_carry_the_key() {
        let partial = Record::new().with("x", 9);
        let doc = record_to_document(&partial, &items()).expect("to doc");
        assert!(!doc.contains_key(MONGO_ID));

        let err = keyed_document(&partial, &items()).unwrap_err();
        assert!(matches!(err, DataError::Validation(_)));
    }
}
