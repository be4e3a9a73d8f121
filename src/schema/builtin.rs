//! Descriptors for the tables the provider and OpenRouter services store.
//!
//! Field names and types match the data already stored by those services
//! and must not change.

use crate::schema::{FieldDescriptor, FieldType, SchemaDescriptor};

pub const OPENAI_PROVIDERS: &str = "openai_providers";
pub const WORKSPACE_OPENROUTER_SETTINGS: &str = "workspace_openrouter_settings";
pub const GLOBAL_OPENROUTER_SETTINGS: &str = "global_openrouter_settings";

/// Id of the single row in [`GLOBAL_OPENROUTER_SETTINGS`].
pub const GLOBAL_SETTINGS_ID: &str = "global";

fn timestamps(schema: SchemaDescriptor) -> SchemaDescriptor {
    schema
        .field(FieldDescriptor::new("createdAt", FieldType::DateTime))
        .field(FieldDescriptor::new("updatedAt", FieldType::DateTime))
}

/// AI-provider credentials, optionally scoped to a workspace.
pub fn openai_providers() -> SchemaDescriptor {
    timestamps(
        SchemaDescriptor::new(OPENAI_PROVIDERS)
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("name", FieldType::String))
            .field(FieldDescriptor::new("apiKey", FieldType::String).sensitive())
            .field(FieldDescriptor::new("isActive", FieldType::Bool))
            .field(FieldDescriptor::new("workspaceId", FieldType::String).nullable()),
    )
}

/// Per-workspace OpenRouter settings; one row per workspace.
pub fn workspace_openrouter_settings() -> SchemaDescriptor {
    timestamps(
        SchemaDescriptor::new(WORKSPACE_OPENROUTER_SETTINGS)
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("workspaceId", FieldType::String))
            .field(FieldDescriptor::new("apiKey", FieldType::String).sensitive())
            .field(FieldDescriptor::new("selectedModels", FieldType::Json))
            .field(FieldDescriptor::new("isEnabled", FieldType::Bool)),
    )
    .unique(["workspaceId"])
}

/// Global OpenRouter settings: a singleton row keyed by
/// [`GLOBAL_SETTINGS_ID`].
pub fn global_openrouter_settings() -> SchemaDescriptor {
    timestamps(
        SchemaDescriptor::new(GLOBAL_OPENROUTER_SETTINGS)
            .field(FieldDescriptor::new("id", FieldType::String))
            .field(FieldDescriptor::new("apiKey", FieldType::String).sensitive())
            .field(FieldDescriptor::new("selectedModels", FieldType::Json))
            .field(FieldDescriptor::new("isEnabled", FieldType::Bool)),
    )
}

pub fn all() -> Vec<SchemaDescriptor> {
    vec![
        openai_providers(),
        workspace_openrouter_settings(),
        global_openrouter_settings(),
    ]
}

#[cfg(test)]
mod tests {
    #[test]
    fn builtin_descriptors_are_valid() {
        for schema in super::all() {
            schema.validate().expect("builtin descriptor must validate");
            assert!(
                schema.sensitive_fields().any(|f| f.name == "apiKey"),
                "{} must mark apiKey sensitive",
                schema.table_name
            );
        }
    }

    #[test]
    fn provider_columns_match_stored_shape() {
        let schema = super::openai_providers();
        let columns: Vec<&str> = schema.column_names().collect();
        assert_eq!(
            columns,
            vec![
                "id",
                "name",
                "apiKey",
                "isActive",
                "workspaceId",
                "createdAt",
                "updatedAt"
            ]
        );
    }
}
