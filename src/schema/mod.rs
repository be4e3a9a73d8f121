//! Declarative table/collection descriptors and the in-process registry.

pub mod builtin;
pub mod ddl;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::record::{Record, Value};

/// Longest identifier accepted by every supported dialect.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Bool,
    #[serde(rename = "datetime")]
    DateTime,
    Json,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::DateTime => "datetime",
            Self::Json => "json",
        }
    }

    /// Whether a value may be stored in a field of this type. `Null` is
    /// checked separately against `nullable`.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Json, _) => true,
            (Self::String, Value::Text(_)) => true,
            (Self::Int, Value::Int(_)) => true,
            (Self::Int, Value::Float(f)) => f.fract() == 0.0,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::DateTime, Value::DateTime(_)) => true,
            (Self::DateTime, Value::Text(raw)) => {
                chrono::DateTime::parse_from_rfc3339(raw).is_ok()
            }
            _ => false,
        }
    }

    /// Whether a filter may compare a field of this type against `value`.
    /// Same rules as storage, except json fields only compare against
    /// `Null`.
    pub fn accepts_filter(self, value: &Value) -> bool {
        match self {
            Self::Json => value.is_null(),
            _ => self.accepts(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
    /// Stored as an `ivHex:cipherHex` secret by callers.
    #[serde(default)]
    pub sensitive: bool,
}

impl FieldDescriptor {
    /// A non-nullable, non-sensitive field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            sensitive: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Shape of one logical table. `table_name` is immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    pub table_name: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub unique_constraints: Vec<Vec<String>>,
}

/// Reject anything that is not a plain SQL identifier; names are
/// interpolated into DDL and DML.
pub fn validate_identifier(kind: &str, name: &str) -> Result<(), DataError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(DataError::Validation(format!(
            "invalid {kind} name '{name}': expected [A-Za-z_][A-Za-z0-9_]* of at most {MAX_IDENTIFIER_LEN} chars"
        )));
    }
    Ok(())
}

impl SchemaDescriptor {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            fields: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_constraints
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldDescriptor, DataError> {
        self.get_field(name).ok_or_else(|| {
            DataError::Validation(format!(
                "unknown field '{}' on table '{}'",
                name, self.table_name
            ))
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn sensitive_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.sensitive)
    }

    /// Structural checks: identifiers, a string `id`, no duplicate fields,
    /// unique constraints over declared fields.
    pub fn validate(&self) -> Result<(), DataError> {
        validate_identifier("table", &self.table_name)?;
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            validate_identifier("field", &field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(DataError::Validation(format!(
                    "field '{}' declared twice on '{}'",
                    field.name, self.table_name
                )));
            }
        }
        match self.get_field("id") {
            Some(id) if id.field_type == FieldType::String && !id.nullable => {}
            _ => {
                return Err(DataError::Validation(format!(
                    "table '{}' must declare a non-nullable string 'id' field",
                    self.table_name
                )));
            }
        }
        for constraint in &self.unique_constraints {
            if constraint.is_empty() {
                return Err(DataError::Validation(format!(
                    "empty unique constraint on '{}'",
                    self.table_name
                )));
            }
            for column in constraint {
                self.require_field(column)?;
            }
        }
        Ok(())
    }

    /// Check a full record before insert/upsert: known fields, matching
    /// types, non-nullable fields present.
    pub fn validate_record(&self, record: &Record) -> Result<(), DataError> {
        match record.id() {
            Some(id) if !id.is_empty() => {}
            _ => {
                return Err(DataError::Validation(format!(
                    "record for '{}' must carry a non-empty string 'id'",
                    self.table_name
                )));
            }
        }
        self.validate_partial(record)?;
        for field in self.fields.iter().filter(|f| !f.nullable) {
            if record.value_or_null(&field.name).is_null() {
                return Err(DataError::Validation(format!(
                    "field '{}' on '{}' is required",
                    field.name, self.table_name
                )));
            }
        }
        Ok(())
    }

    /// Check a partial update: every present field is declared and typed
    /// correctly.
    pub fn validate_partial(&self, partial: &Record) -> Result<(), DataError> {
        for (name, value) in partial.iter() {
            let field = self.require_field(name)?;
            if value.is_null() && !field.nullable {
                return Err(DataError::Validation(format!(
                    "field '{}' on '{}' is not nullable",
                    name, self.table_name
                )));
            }
            if !field.field_type.accepts(value) {
                return Err(DataError::Validation(format!(
                    "field '{}' on '{}' expects {}, got {}",
                    name,
                    self.table_name,
                    field.field_type.as_str(),
                    value.kind()
                )));
            }
        }
        Ok(())
    }
}

/// Registered descriptors keyed by logical table name.
///
/// First writer wins: registering a name that already exists returns the
/// existing descriptor and reports whether the shapes differ.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<String, Arc<SchemaDescriptor>>>,
}

/// Result of [`SchemaRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub descriptor: Arc<SchemaDescriptor>,
    /// True when an existing entry with a different shape was kept.
    pub shape_mismatch: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: SchemaDescriptor) -> Registration {
        let mut tables = match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tables.get(&descriptor.table_name) {
            Some(existing) => Registration {
                shape_mismatch: **existing != descriptor,
                descriptor: Arc::clone(existing),
            },
            None => {
                let descriptor = Arc::new(descriptor);
                tables.insert(descriptor.table_name.clone(), Arc::clone(&descriptor));
                Registration {
                    descriptor,
                    shape_mismatch: false,
                }
            }
        }
    }

    pub fn get(&self, table: &str) -> Option<Arc<SchemaDescriptor>> {
        let tables = match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tables.get(table).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let tables = match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldDescriptor, FieldType, SchemaDescriptor, SchemaRegistry, validate_identifier};
    use crate::error::DataError;
    use crate::record::{Record, Value};

    fn providers() -> SchemaDescriptor {
        SchemaDescriptor::new("providers")
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("name", FieldType::String))
            .field(FieldDescriptor::new("apiKey", FieldType::String).sensitive())
            .field(FieldDescriptor::new("isActive", FieldType::Bool))
            .field(FieldDescriptor::new("workspaceId", FieldType::String).nullable())
    }

    #[test]
    fn identifiers_must_be_sql_safe() {
        assert!(validate_identifier("table", "openai_providers").is_ok());
        assert!(validate_identifier("field", "apiKey").is_ok());
        assert!(validate_identifier("table", "x; DROP TABLE y").is_err());
        assert!(validate_identifier("table", "1abc").is_err());
        assert!(validate_identifier("table", "").is_err());
        assert!(validate_identifier("table", &"a".repeat(64)).is_err());
    }

    #[test]
    fn descriptor_requires_string_id() {
        let missing = SchemaDescriptor::new("t").field(FieldDescriptor::new("x", FieldType::Int));
        assert!(matches!(missing.validate(), Err(DataError::Validation(_))));
        let int_id = SchemaDescriptor::new("t").field(FieldDescriptor::new("id", FieldType::Int));
        assert!(int_id.validate().is_err());
        assert!(providers().validate().is_ok());
    }

    #[test]
    fn unique_constraints_must_reference_declared_fields() {
        let bad = providers().unique(["owner"]);
        assert!(bad.validate().is_err());
        let good = providers().unique(["workspaceId", "name"]);
        assert!(good.validate().is_ok());
    }

    #[test]
    fn validate_record_checks_required_and_types() {
        let schema = providers();
        let ok = Record::new()
            .with("id", "p1")
            .with("name", "Acme")
            .with("apiKey", "00:11")
            .with("isActive", true);
        assert!(schema.validate_record(&ok).is_ok());

        let missing_name = ok.clone().with("name", Value::Null);
        assert!(schema.validate_record(&missing_name).is_err());

        let wrong_type = ok.clone().with("isActive", "yes");
        let err = schema.validate_record(&wrong_type).expect_err("bool expected");
        assert!(err.to_string().contains("expects bool"), "unexpected: {err}");

        let unknown = ok.with("extra", 1);
        assert!(schema.validate_record(&unknown).is_err());
    }

    #[test]
    fn registry_is_first_writer_wins() {
        let registry = SchemaRegistry::new();
        let first = registry.register(providers());
        assert!(!first.shape_mismatch);

        let again = registry.register(providers());
        assert!(!again.shape_mismatch);

        let changed = registry.register(
            providers().field(FieldDescriptor::new("extra", FieldType::Int).nullable()),
        );
        assert!(changed.shape_mismatch);
        assert_eq!(changed.descriptor.fields.len(), 5);
        assert_eq!(registry.table_names(), vec!["providers".to_string()]);
    }

    #[test]
    fn sensitive_fields_are_listed() {
        let schema = providers();
        let names: Vec<&str> = schema.sensitive_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["apiKey"]);
    }
}
