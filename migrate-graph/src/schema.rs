use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reading a schema file needs both an I/O step and a parse step; kept as
/// its own small error type rather than folding it into [`crate::GraphError`],
/// which is about graph construction, not file access.
#[derive(Debug, Error)]
pub enum SchemaFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid schema json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One lookup/reference relationship declared on an entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub target: String,
    pub field: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub many_to_many: bool,
    #[serde(default)]
    pub intersect_entity: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

/// The shape the graph builder consumes. Parsing it out of a concrete
/// format (JSON, YAML, a metadata API response) is left to a
/// [`crate::SchemaReader`] implementation; the builder only ever sees this.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MigrationSchema {
    pub entities: Vec<EntitySchema>,
}

/// Reads a [`MigrationSchema`] from some external representation. Parsing
/// format is out of scope for the core; this trait is the seam.
pub trait SchemaReader {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read_schema(&self) -> Result<MigrationSchema, Self::Error>;
}

/// Reads a [`MigrationSchema`] from a `serde_json::Value` (or, via
/// [`JsonSchemaReader::from_file`], a JSON file on disk). Good enough to
/// run and test the graph builder and importer without a real metadata
/// service.
pub struct JsonSchemaReader {
    value: serde_json::Value,
}

impl JsonSchemaReader {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, SchemaFileError> {
        let contents = std::fs::read_to_string(path)?;
        let value = serde_json::from_str(&contents)?;
        Ok(Self { value })
    }
}

impl SchemaReader for JsonSchemaReader {
    type Error = serde_json::Error;

    fn read_schema(&self) -> Result<MigrationSchema, Self::Error> {
        serde_json::from_value(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_entities_and_relationships_from_json() {
        let reader = JsonSchemaReader::new(serde_json::json!({
            "entities": [
                {
                    "name": "account",
                    "fields": ["name"],
                    "relationships": [
                        {"name": "primary_contact", "target": "contact", "field": "primary_contact", "mandatory": false}
                    ]
                },
                {
                    "name": "contact",
                    "fields": ["name"],
                    "relationships": [
                        {"name": "primary_account", "target": "account", "field": "primary_account", "mandatory": true}
                    ]
                }
            ]
        }));

        let schema = reader.read_schema().expect("valid schema");
        assert_eq!(schema.entities.len(), 2);
        assert_eq!(schema.entities[0].relationships[0].target, "contact");
    }
}
