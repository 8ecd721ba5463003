use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::record::RecordId;

/// Classification carried by every per-record failure surfaced in a
/// [`crate::MigrationResult`]. This is the leaf of the error chain: every
/// crate-level `{Crate}ErrorKind` (each `thiserror` enum used for `?`
/// propagation within this codebase) ultimately maps into one of these
/// variants when it's recorded against a record or a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The service rejected the request with a retry-after penalty. Surfaces
    /// only once `max_batch_retries` or `max_retry_after_tolerance` is exceeded.
    Throttled,
    /// No pooled client could be produced before `acquire_timeout` elapsed.
    PoolExhausted,
    /// The soonest throttle clear exceeds `max_retry_after_tolerance`.
    ThrottleExceedsTolerance,
    /// A pooled client failed validation and could not be replaced.
    ConnectionFailed,
    /// The service doesn't support bulk operations for this entity/operation pair.
    BulkNotSupportedOnEntity,
    /// A lookup/reference field pointed at a record that doesn't exist (yet).
    ReferenceNotFound,
    /// The service rejected the record as a duplicate of an existing one.
    DuplicateRecord,
    /// A mandatory field was missing from the record.
    RequiredFieldMissing,
    /// The identity lacks permission to perform this operation.
    PermissionDenied,
    /// A network or timeout error that is expected to clear on retry.
    TransientNetwork,
    /// The run was cancelled before this record was attempted or completed.
    Cancelled,
    /// Anything the service returned that doesn't map to a known kind.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Throttled => "throttled",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::ThrottleExceedsTolerance => "throttle_exceeds_tolerance",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::BulkNotSupportedOnEntity => "bulk_not_supported_on_entity",
            ErrorKind::ReferenceNotFound => "reference_not_found",
            ErrorKind::DuplicateRecord => "duplicate_record",
            ErrorKind::RequiredFieldMissing => "required_field_missing",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A single record (or whole-batch) failure, as recorded in a [`crate::MigrationResult`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordError {
    pub entity: String,
    pub record_id: Option<RecordId>,
    pub field: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl RecordError {
    pub fn new(entity: impl Into<String>, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            record_id: None,
            field: None,
            error_kind,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_record_id(mut self, record_id: impl Into<RecordId>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}
