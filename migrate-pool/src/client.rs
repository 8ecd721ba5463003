use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use migrate_common::{Operation, Record, RecordId};
use serde::{Deserialize, Serialize};

/// Pass-through hints and batching parameters a call carries to the service.
/// These are the same knobs the executor exposes as `ExecuteOptions`; the
/// client trait only needs to forward them, not interpret them.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub bypass_plugins: bool,
    pub bypass_flows: bool,
}

/// Per-record outcome within a bulk response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub record_id: Option<RecordId>,
    pub success: bool,
    pub error: Option<ServiceError>,
}

/// Response to a `send_bulk` call: one outcome per submitted record, in the
/// same order the records were submitted (the service's native per-batch
/// ordering, per the no-cross-batch-ordering-guarantee rule).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BulkResponse {
    pub outcomes: Vec<RecordOutcome>,
}

/// Response to a `send_single` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleResponse {
    pub record_id: Option<RecordId>,
    pub success: bool,
    pub error: Option<ServiceError>,
}

/// The machine-parseable shape of a service error, as described in §6:
/// "errors carry a machine-parseable kind, an optional retry_after for
/// throttles, an optional field name, and a message."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub retry_after: Option<Duration>,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    Throttled,
    BulkNotSupportedOnEntity,
    ReferenceNotFound,
    DuplicateRecord,
    RequiredFieldMissing,
    PermissionDenied,
    TransientNetwork,
    Unknown,
}

/// A transport-level failure: the call never reached the service, or the
/// connection itself is no longer usable. Distinct from a [`ServiceError`],
/// which is a well-formed response the service chose to send.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("connection is no longer valid")]
    Invalid,
}

/// The abstract operations the core depends on from a pooled, authenticated
/// service connection. Concrete implementations (HTTP/OData, gRPC, etc.) are
/// external collaborators; the core only ever calls through this trait.
///
/// Object-safe and boxed (`Box<dyn ServiceClient>`) so the pool can hold a
/// heterogeneous-looking but uniformly-typed list of clients without a
/// generic parameter threading through every crate above it — the same
/// `box_clone` + `impl Clone for Box<dyn Trait>` shape used elsewhere in
/// this codebase for pooled, boxed trait objects.
#[async_trait]
pub trait ServiceClient: Send + Sync + fmt::Debug {
    /// Submits `records` as one bulk request for `entity`/`op`.
    async fn send_bulk(
        &self,
        entity: &str,
        op: Operation,
        records: &[Record],
        options: &CallOptions,
    ) -> Result<BulkResponse, ClientError>;

    /// Submits a single record for `entity`/`op`. Used both for true
    /// per-record mode and for the one-record bulk-capability probe.
    async fn send_single(
        &self,
        entity: &str,
        op: Operation,
        record: &Record,
        options: &CallOptions,
    ) -> Result<SingleResponse, ClientError>;

    /// Cheap liveness check run before vending a client from the free list.
    async fn validate(&self) -> bool;

    /// The service's latest recommended DOP for this identity, if it can be
    /// read without a network round trip (e.g. from the last response's
    /// headers). `None` means "no update available"; the source's last
    /// known value is kept.
    fn recommended_max_dop(&self) -> Option<u32> {
        None
    }

    fn box_clone(&self) -> Box<dyn ServiceClient>;
}

impl Clone for Box<dyn ServiceClient> {
    fn clone(&self) -> Box<dyn ServiceClient> {
        self.box_clone()
    }
}
