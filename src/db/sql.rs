//! Filter DSL to SQL translation shared by the relational adapters and the
//! embedded store's write path.
//!
//! Every value is bound as a parameter; identifiers come from validated
//! descriptors and are quoted per dialect.

use chrono::{DateTime, Utc};

use crate::error::DataError;
use crate::query::{FilterCondition, Operator, QuerySpec, SortDirection};
use crate::record::{Record, Value};
use crate::schema::ddl::Dialect;
use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

/// A bound parameter, typed by the column it targets. `None` binds a typed
/// SQL `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(Option<String>),
    Int(Option<i64>),
    Bool(Option<bool>),
    DateTime(Option<DateTime<Utc>>),
    Json(Option<serde_json::Value>),
}

impl SqlParam {
    /// Coerce `value` into the declared type of `field`.
    pub fn coerce(value: &Value, field: &FieldDescriptor) -> Result<Self, DataError> {
        let mismatch = || {
            DataError::Validation(format!(
                "field '{}' expects {}, got {}",
                field.name,
                field.field_type.as_str(),
                value.kind()
            ))
        };
        Ok(match (field.field_type, value) {
            (FieldType::String, Value::Null) => Self::Text(None),
            (FieldType::String, Value::Text(s)) => Self::Text(Some(s.clone())),
            (FieldType::Int, Value::Null) => Self::Int(None),
            (FieldType::Int, Value::Int(i)) => Self::Int(Some(*i)),
            (FieldType::Int, Value::Float(f)) if f.fract() == 0.0 => Self::Int(Some(*f as i64)),
            (FieldType::Bool, Value::Null) => Self::Bool(None),
            (FieldType::Bool, Value::Bool(b)) => Self::Bool(Some(*b)),
            (FieldType::DateTime, Value::Null) => Self::DateTime(None),
            (FieldType::DateTime, Value::DateTime(dt)) => Self::DateTime(Some(*dt)),
            (FieldType::DateTime, Value::Text(raw)) => Self::DateTime(Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| mismatch())?
                    .with_timezone(&Utc),
            )),
            (FieldType::Json, Value::Null) => Self::Json(None),
            (FieldType::Json, other) => Self::Json(Some(other.to_json())),
            _ => return Err(mismatch()),
        })
    }
}

/// SQL text plus its parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Builds statements for one dialect. Placeholders are numbered as they are
/// pushed, so clauses must be rendered in statement order.
#[derive(Debug)]
struct Builder {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl Builder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn quote(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
        }
    }

    /// ` WHERE ...` or the empty string.
    fn where_clause(
        &mut self,
        schema: &SchemaDescriptor,
        conditions: &[FilterCondition],
    ) -> Result<String, DataError> {
        if conditions.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(conditions.len());
        for condition in conditions {
            parts.push(self.condition(schema, condition)?);
        }
        Ok(format!(" WHERE {}", parts.join(" AND ")))
    }

    fn condition(
        &mut self,
        schema: &SchemaDescriptor,
        condition: &FilterCondition,
    ) -> Result<String, DataError> {
        let field = schema.require_field(&condition.field)?;
        let col = self.quote(&field.name);
        let values = condition.value.values();

        Ok(match condition.operator {
            Operator::Eq => match values.first() {
                None | Some(Value::Null) => format!("{col} IS NULL"),
                Some(value) => {
                    let p = self.bind(SqlParam::coerce(value, field)?);
                    format!("{col} = {p}")
                }
            },
            Operator::Ne => match values.first() {
                None | Some(Value::Null) => format!("{col} IS NOT NULL"),
                Some(value) => {
                    let p = self.bind(SqlParam::coerce(value, field)?);
                    format!("({col} <> {p} OR {col} IS NULL)")
                }
            },
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let op = match condition.operator {
                    Operator::Gt => ">",
                    Operator::Gte => ">=",
                    Operator::Lt => "<",
                    _ => "<=",
                };
                let value = values.first().ok_or_else(|| {
                    DataError::Validation(format!("'{}' needs a value", condition.field))
                })?;
                let p = self.bind(SqlParam::coerce(value, field)?);
                format!("{col} {op} {p}")
            }
            Operator::In => {
                let includes_null = values.iter().any(Value::is_null);
                let mut placeholders = Vec::new();
                for value in values.iter().filter(|v| !v.is_null()) {
                    placeholders.push(self.bind(SqlParam::coerce(value, field)?));
                }
                match (placeholders.is_empty(), includes_null) {
                    (true, false) => "1 = 0".to_string(),
                    (true, true) => format!("{col} IS NULL"),
                    (false, false) => format!("{col} IN ({})", placeholders.join(", ")),
                    (false, true) => {
                        format!("({col} IN ({}) OR {col} IS NULL)", placeholders.join(", "))
                    }
                }
            }
        })
    }

    fn order_clause(&self, query: &QuerySpec) -> String {
        if query.order_by.is_empty() {
            return String::new();
        }
        let keys = query
            .order_by
            .iter()
            .map(|sort| {
                let col = self.quote(&sort.field);
                // Nulls sort first ascending on every engine; only Postgres
                // needs telling.
                match (self.dialect, sort.direction) {
                    (Dialect::Postgres, SortDirection::Asc) => format!("{col} ASC NULLS FIRST"),
                    (Dialect::Postgres, SortDirection::Desc) => format!("{col} DESC NULLS LAST"),
                    (_, SortDirection::Asc) => format!("{col} ASC"),
                    (_, SortDirection::Desc) => format!("{col} DESC"),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(" ORDER BY {keys}")
    }

    fn insert_values(
        &mut self,
        schema: &SchemaDescriptor,
        record: &Record,
    ) -> Result<(String, String), DataError> {
        let mut columns = Vec::with_capacity(schema.fields.len());
        let mut placeholders = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            columns.push(self.quote(&field.name));
            let param = SqlParam::coerce(record.value_or_null(&field.name), field)?;
            placeholders.push(self.bind(param));
        }
        Ok((columns.join(", "), placeholders.join(", ")))
    }
}

/// Descriptor fields returned by a query, in column order.
pub fn selected_fields<'a>(
    schema: &'a SchemaDescriptor,
    select: Option<&[String]>,
) -> Result<Vec<&'a FieldDescriptor>, DataError> {
    match select {
        Some(names) => names.iter().map(|n| schema.require_field(n)).collect(),
        None => Ok(schema.fields.iter().collect()),
    }
}

pub fn select(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    query: &QuerySpec,
    limit: Option<usize>,
) -> Result<SqlStatement, DataError> {
    let mut b = Builder::new(dialect);
    let columns = selected_fields(schema, query.select.as_deref())?
        .iter()
        .map(|f| b.quote(&f.name))
        .collect::<Vec<_>>()
        .join(", ");
    let where_clause = b.where_clause(schema, &query.conditions)?;
    let order = b.order_clause(query);
    let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
    let sql = format!(
        "SELECT {columns} FROM {}{where_clause}{order}{limit}",
        b.quote(&schema.table_name)
    );
    Ok(b.finish(sql))
}

pub fn count(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    conditions: &[FilterCondition],
) -> Result<SqlStatement, DataError> {
    let mut b = Builder::new(dialect);
    let where_clause = b.where_clause(schema, conditions)?;
    let sql = format!(
        "SELECT COUNT(*) FROM {}{where_clause}",
        b.quote(&schema.table_name)
    );
    Ok(b.finish(sql))
}

pub fn insert(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    record: &Record,
) -> Result<SqlStatement, DataError> {
    let mut b = Builder::new(dialect);
    let (columns, values) = b.insert_values(schema, record)?;
    let sql = format!(
        "INSERT INTO {} ({columns}) VALUES ({values})",
        b.quote(&schema.table_name)
    );
    Ok(b.finish(sql))
}

/// Insert or replace every non-key column of the row with the same `id`.
///
/// The conflict target is `id` alone, so a clash on any other unique
/// constraint still fails. MySQL has no such statement (`ON DUPLICATE KEY`
/// fires on every unique key); its adapter combines [`lock_by_id`],
/// [`replace`] and [`insert`] in a transaction instead.
pub fn upsert(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    record: &Record,
) -> Result<SqlStatement, DataError> {
    let excluded = match dialect {
        Dialect::Postgres => "EXCLUDED",
        Dialect::Sqlite => "excluded",
        Dialect::MySql => {
            return Err(DataError::Query(
                "MySQL has no id-scoped upsert statement".to_string(),
            ));
        }
    };
    let mut b = Builder::new(dialect);
    let (columns, values) = b.insert_values(schema, record)?;
    let assignments = schema
        .fields
        .iter()
        .filter(|f| f.name != "id")
        .map(|f| {
            let col = b.quote(&f.name);
            format!("{col} = {excluded}.{col}")
        })
        .collect::<Vec<_>>();
    let table = b.quote(&schema.table_name);
    let id = b.quote("id");
    let sql = if assignments.is_empty() {
        format!("INSERT INTO {table} ({columns}) VALUES ({values}) ON CONFLICT ({id}) DO NOTHING")
    } else {
        format!(
            "INSERT INTO {table} ({columns}) VALUES ({values}) ON CONFLICT ({id}) DO UPDATE SET {}",
            assignments.join(", ")
        )
    };
    Ok(b.finish(sql))
}

/// `SELECT id ... FOR UPDATE` on one row; run inside a transaction.
pub fn lock_by_id(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    id: &str,
) -> Result<SqlStatement, DataError> {
    let mut b = Builder::new(dialect);
    let where_clause = b.where_clause(schema, &[FilterCondition::eq("id", id)])?;
    let sql = format!(
        "SELECT {} FROM {}{where_clause} FOR UPDATE",
        b.quote("id"),
        b.quote(&schema.table_name)
    );
    Ok(b.finish(sql))
}

/// Overwrite every non-key column of the row with `record`'s `id`; absent
/// fields become `NULL`. `None` when the table has no non-key columns.
pub fn replace(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    record: &Record,
) -> Result<Option<SqlStatement>, DataError> {
    let id = record
        .id()
        .ok_or_else(|| DataError::Validation("record has no 'id'".to_string()))?;
    let full: Record = schema
        .fields
        .iter()
        .filter(|f| f.name != "id")
        .map(|f| (f.name.clone(), record.value_or_null(&f.name).clone()))
        .collect();
    if full.is_empty() {
        return Ok(None);
    }
    update(dialect, schema, &full, &[FilterCondition::eq("id", id)]).map(Some)
}

pub fn update(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    partial: &Record,
    conditions: &[FilterCondition],
) -> Result<SqlStatement, DataError> {
    if partial.is_empty() {
        return Err(DataError::Validation(
            "update needs at least one field".to_string(),
        ));
    }
    let mut b = Builder::new(dialect);
    let mut assignments = Vec::with_capacity(partial.len());
    for (name, value) in partial.iter() {
        let field = schema.require_field(name)?;
        let col = b.quote(&field.name);
        let p = b.bind(SqlParam::coerce(value, field)?);
        assignments.push(format!("{col} = {p}"));
    }
    let where_clause = b.where_clause(schema, conditions)?;
    let sql = format!(
        "UPDATE {} SET {}{where_clause}",
        b.quote(&schema.table_name),
        assignments.join(", ")
    );
    Ok(b.finish(sql))
}

pub fn delete(
    dialect: Dialect,
    schema: &SchemaDescriptor,
    conditions: &[FilterCondition],
) -> Result<SqlStatement, DataError> {
    let mut b = Builder::new(dialect);
    let where_clause = b.where_clause(schema, conditions)?;
    let sql = format!("DELETE FROM {}{where_clause}", b.quote(&schema.table_name));
    Ok(b.finish(sql))
}
