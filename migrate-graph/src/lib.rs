//! Builds an entity dependency graph from a declarative schema and
//! partitions it into topological tiers, breaking circular references with
//! deferred-field edges rather than failing to order the data at all.

mod error;
mod graph;
mod schema;

pub use error::{GraphError, GraphErrorKind};
pub use graph::{DependencyEdge, DependencyGraph};
pub use schema::{EntitySchema, JsonSchemaReader, MigrationSchema, Relationship, SchemaFileError, SchemaReader};
