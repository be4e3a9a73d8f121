//! Cross-engine persistence core.
//!
//! One engine-agnostic filter DSL ([`query`]) executed against an embedded
//! single-file store, a document store, PostgreSQL or MySQL, behind the
//! [`service::UniversalDataService`] facade. Fields marked sensitive in a
//! [`schema::SchemaDescriptor`] can be sealed with [`crypto::SecretCodec`]
//! before they are stored.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod query;
pub mod record;
pub mod schema;
pub mod service;
pub mod settings;

pub use config::{Config, DatabaseBackend, DatabaseConfig, SchemaConflictPolicy};
pub use crypto::SecretCodec;
pub use db::{EngineAdapter, MutationResult};
pub use error::{CodecError, ConfigError, DataError};
pub use query::{FilterCondition, QuerySpec, SortSpec};
pub use record::{Record, Value};
pub use schema::{FieldDescriptor, FieldType, SchemaDescriptor};
pub use service::{SortOrderOutcome, UniversalDataService};
