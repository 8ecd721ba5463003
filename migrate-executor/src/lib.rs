//! Batches requests against the service, probes bulk-operation capability
//! once per entity/operation, and falls back to per-record calls when bulk
//! isn't supported — all driven through a [`migrate_pool::ConnectionPool`],
//! which remains the sole concurrency limiter.

mod batch;
mod capability;
mod error;
mod executor;
mod options;

pub use capability::CapabilityCache;
pub use error::{ExecutorError, ExecutorErrorKind};
pub use executor::BulkOperationExecutor;
pub use options::ExecuteOptions;
