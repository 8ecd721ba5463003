use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifiers are opaque to the core; in practice they're server-assigned UUIDs,
/// but nothing here assumes that shape.
pub type RecordId = String;

/// A single homogeneous record operation against one entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
        }
    }
}

/// Fields the service treats as ownership metadata. Stripped wholesale when
/// `strip_owner_fields` is set, otherwise candidates for `user_mapping`.
pub const OWNER_FIELDS: &[&str] = &["owner", "created_by", "modified_by"];

/// A record is a flat key/value map. `BTreeMap` keeps field iteration order
/// deterministic, which matters for batch-ordering tests and for picking a
/// deterministic id out of a record without a schema.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Best-effort extraction of the record's id, by convention the `id` field.
    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(|v| v.as_str()).map(str::to_owned)
    }

    /// Drops ownership fields wholesale, in place.
    pub fn strip_owner_fields(&mut self) {
        for field in OWNER_FIELDS {
            self.0.remove(*field);
        }
    }

    /// Applies `mapping` to every owner-ish field present in the record,
    /// leaving fields the mapping doesn't recognize untouched.
    pub fn apply_user_mapping<F>(&mut self, mapping: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for field in OWNER_FIELDS {
            if let Some(Value::String(source_user_id)) = self.0.get(*field) {
                if let Some(target_user_id) = mapping(source_user_id) {
                    self.0.insert((*field).to_owned(), Value::String(target_user_id));
                }
            }
        }
    }

    /// Returns a copy containing only the named fields, plus `id` if present.
    /// Used to build the deferred-field update pass.
    pub fn project(&self, fields: &[String]) -> Record {
        let mut projected = Record::new();
        if let Some(id) = self.0.get("id") {
            projected.0.insert("id".to_owned(), id.clone());
        }
        for field in fields {
            if let Some(value) = self.0.get(field) {
                projected.0.insert(field.clone(), value.clone());
            }
        }
        projected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_owner_fields_removes_all_three() {
        let mut record = Record::new();
        record.insert("owner", Value::String("u1".into()));
        record.insert("created_by", Value::String("u1".into()));
        record.insert("modified_by", Value::String("u2".into()));
        record.insert("name", Value::String("keep me".into()));

        record.strip_owner_fields();

        assert_eq!(record.get("owner"), None);
        assert_eq!(record.get("created_by"), None);
        assert_eq!(record.get("modified_by"), None);
        assert!(record.get("name").is_some());
    }

    #[test]
    fn user_mapping_only_touches_known_owner_fields() {
        let mut record = Record::new();
        record.insert("owner", Value::String("source-1".into()));
        record.insert("name", Value::String("source-1".into()));

        record.apply_user_mapping(|id| if id == "source-1" { Some("target-1".into()) } else { None });

        assert_eq!(record.get("owner").unwrap(), "target-1");
        // Unrelated field with the same value is left alone.
        assert_eq!(record.get("name").unwrap(), "source-1");
    }

    #[test]
    fn project_keeps_id_and_named_fields_only() {
        let mut record = Record::new();
        record.insert("id", Value::String("r1".into()));
        record.insert("primary_contact", Value::String("c1".into()));
        record.insert("name", Value::String("acme".into()));

        let projected = record.project(&["primary_contact".to_owned()]);

        assert_eq!(projected.get("id").unwrap(), "r1");
        assert_eq!(projected.get("primary_contact").unwrap(), "c1");
        assert_eq!(projected.get("name"), None);
    }
}
