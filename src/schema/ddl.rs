//! Dialect-specific DDL rendering for the relational and embedded engines.

use crate::schema::{FieldDescriptor, FieldType, MAX_IDENTIFIER_LEN, SchemaDescriptor};

/// SQL dialects spoken by the schema-ful engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Quote an identifier. Names are validated before they get here, so
    /// quoting only preserves case (`apiKey`) and avoids keyword clashes.
    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{ident}`"),
            Self::Postgres | Self::Sqlite => format!("\"{ident}\""),
        }
    }

    /// Positional placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }

    /// Column type for a field. `indexed` columns in MySQL need a bounded
    /// length to take part in a key. Text compares bytewise on every engine:
    /// `"C"` collation on Postgres, `utf8mb4_bin` on MySQL.
    pub fn column_type(self, field_type: FieldType, indexed: bool) -> &'static str {
        match (self, field_type) {
            (Self::Postgres, FieldType::String) => "TEXT COLLATE \"C\"",
            (Self::Postgres, FieldType::Int) => "BIGINT",
            (Self::Postgres, FieldType::Bool) => "BOOLEAN",
            (Self::Postgres, FieldType::DateTime) => "TIMESTAMPTZ",
            (Self::Postgres, FieldType::Json) => "JSONB",
            (Self::MySql, FieldType::String) if indexed => "VARCHAR(255)",
            (Self::MySql, FieldType::String) => "TEXT",
            (Self::MySql, FieldType::Int) => "BIGINT",
            (Self::MySql, FieldType::Bool) => "BOOLEAN",
            (Self::MySql, FieldType::DateTime) => "DATETIME(3)",
            (Self::MySql, FieldType::Json) => "JSON",
            (Self::Sqlite, FieldType::Int | FieldType::Bool) => "INTEGER",
            (Self::Sqlite, _) => "TEXT",
        }
    }

    fn column_def(self, schema: &SchemaDescriptor, field: &FieldDescriptor) -> String {
        let indexed = field.name == "id"
            || schema
                .unique_constraints
                .iter()
                .any(|c| c.iter().any(|col| col == &field.name));
        let mut def = format!(
            "{} {}",
            self.quote(&field.name),
            self.column_type(field.field_type, indexed)
        );
        if field.name == "id" {
            def.push_str(" PRIMARY KEY");
        } else if !field.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    /// `CREATE TABLE IF NOT EXISTS` for the descriptor.
    pub fn create_table(self, schema: &SchemaDescriptor) -> String {
        let columns = schema
            .fields
            .iter()
            .map(|f| self.column_def(schema, f))
            .collect::<Vec<_>>()
            .join(", ");
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(&schema.table_name),
            columns
        );
        match self {
            // Binary collation keeps text comparison case-sensitive.
            Self::MySql => format!("{ddl} DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin"),
            Self::Postgres | Self::Sqlite => ddl,
        }
    }

    /// One statement per unique constraint. MySQL has no
    /// `CREATE INDEX IF NOT EXISTS`; its adapter tolerates the duplicate
    /// key name error instead.
    pub fn create_unique_indexes(self, schema: &SchemaDescriptor) -> Vec<String> {
        schema
            .unique_constraints
            .iter()
            .map(|columns| {
                let name = self.quote(&index_name(&schema.table_name, columns));
                let cols = columns
                    .iter()
                    .map(|c| self.quote(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let table = self.quote(&schema.table_name);
                match self {
                    Self::MySql => format!("CREATE UNIQUE INDEX {name} ON {table} ({cols})"),
                    Self::Postgres | Self::Sqlite => {
                        format!("CREATE UNIQUE INDEX IF NOT EXISTS {name} ON {table} ({cols})")
                    }
                }
            })
            .collect()
    }
}

/// Deterministic unique index name: `ux_<table>_<col>_<col>`, cut to the
/// identifier limit.
pub fn index_name(table: &str, columns: &[String]) -> String {
    let mut name = format!("ux_{}_{}", table, columns.join("_"));
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}
