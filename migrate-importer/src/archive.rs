use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use migrate_common::Record;
use migrate_graph::{JsonSchemaReader, MigrationSchema, SchemaReader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json in {entity}.jsonl: {source}")]
    InvalidJson {
        entity: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse schema.json: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Produces and consumes a migration package: `schema + per-entity record
/// streams`. Parsing/packaging format is out of scope for the core; these
/// traits are the seam.
pub trait ArchiveReader {
    fn read_schema(&self) -> Result<MigrationSchema, ArchiveError>;
    fn read_records(&self, entity: &str) -> Result<Vec<Record>, ArchiveError>;
}

pub trait ArchiveWriter {
    fn write_records(&self, entity: &str, records: &[Record]) -> Result<(), ArchiveError>;
}

/// The supplied default archive format: a directory containing `schema.json`
/// plus one `<entity>.jsonl` file per entity, each line a JSON object
/// record. Not a general-purpose container format; good enough to run and
/// test an end-to-end migration against a local fixture.
pub struct JsonlArchive {
    root: PathBuf,
}

impl JsonlArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entity_path(&self, entity: &str) -> PathBuf {
        self.root.join(format!("{entity}.jsonl"))
    }
}

impl ArchiveReader for JsonlArchive {
    fn read_schema(&self) -> Result<MigrationSchema, ArchiveError> {
        let contents = fs::read_to_string(self.root.join("schema.json"))?;
        let value: serde_json::Value = serde_json::from_str(&contents).map_err(ArchiveError::Schema)?;
        JsonSchemaReader::new(value).read_schema().map_err(ArchiveError::Schema)
    }

    fn read_records(&self, entity: &str) -> Result<Vec<Record>, ArchiveError> {
        let path = self.entity_path(entity);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|source| ArchiveError::InvalidJson {
                entity: entity.to_owned(),
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl ArchiveWriter for JsonlArchive {
    fn write_records(&self, entity: &str, records: &[Record]) -> Result<(), ArchiveError> {
        fs::create_dir_all(&self.root)?;
        let mut file = fs::File::create(self.entity_path(entity))?;
        for record in records {
            let line = serde_json::to_string(record).map_err(|source| ArchiveError::InvalidJson {
                entity: entity.to_owned(),
                source,
            })?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn writes_and_reads_records_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = JsonlArchive::new(dir.path());

        let mut record = Record::new();
        record.insert("id", Value::String("r1".into()));
        record.insert("name", Value::String("acme".into()));

        archive.write_records("account", &[record]).expect("write");
        let read_back = archive.read_records("account").expect("read");

        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].get("name").unwrap(), "acme");
    }

    #[test]
    fn missing_entity_file_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = JsonlArchive::new(dir.path());
        assert_eq!(archive.read_records("ghost").expect("read").len(), 0);
    }

    #[test]
    fn reads_schema_from_schema_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("schema.json"),
            r#"{"entities":[{"name":"account","fields":[],"relationships":[]}]}"#,
        )
        .unwrap();
        let archive = JsonlArchive::new(dir.path());
        let schema = archive.read_schema().expect("schema");
        assert_eq!(schema.entities.len(), 1);
    }
}
