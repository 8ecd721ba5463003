use serde::{Deserialize, Serialize};

use migrate_executor::ExecuteOptions;

/// Per-record semantics applied by the target service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Create,
    Update,
    Upsert,
}

impl Default for ImportMode {
    fn default() -> Self {
        ImportMode::Upsert
    }
}

impl From<ImportMode> for migrate_common::Operation {
    fn from(mode: ImportMode) -> Self {
        match mode {
            ImportMode::Create => migrate_common::Operation::Create,
            ImportMode::Update => migrate_common::Operation::Update,
            ImportMode::Upsert => migrate_common::Operation::Upsert,
        }
    }
}

/// A function mapping a source-system user id to its target-system
/// equivalent, applied to owner-ish fields before send (unless
/// `strip_owner_fields` is set, in which case those fields are dropped
/// wholesale instead).
pub type UserMapping = std::sync::Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct ImportOptions {
    pub import_mode: ImportMode,
    pub continue_on_error: bool,
    pub user_mapping: Option<UserMapping>,
    pub execute: ExecuteOptions,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            import_mode: ImportMode::default(),
            continue_on_error: false,
            user_mapping: None,
            execute: ExecuteOptions::default(),
        }
    }
}
