//! Multi-identity connection pooling: authenticated clients checked out
//! against an admission limit, with throttle-aware waiting and per-identity
//! degree-of-parallelism caps.
//!
//! The three-phase acquisition algorithm lives in [`pool::ConnectionPool`]:
//!
//! 1. Wait (holding no admission permit) until at least one source is
//!    non-throttled.
//! 2. Acquire a system-wide admission permit from the pool's semaphore,
//!    sized to the sum of every source's degree of parallelism.
//! 3. Select a concrete source by the configured [`pool::SelectionStrategy`]
//!    and vend a client, creating one if the source's free list is empty and
//!    it still has room under its own cap.

mod client;
mod error;
mod pool;
mod source;
mod throttle;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use client::{
    BulkResponse, CallOptions, ClientError, RecordOutcome, ServiceClient, ServiceError,
    ServiceErrorKind, SingleResponse,
};
pub use error::{PoolError, PoolErrorKind};
pub use pool::{ConnectionPool, PoolConfig, PooledClient, SelectionStrategy};
pub use source::{ConnectionSource, StaticTokenSource};
pub use throttle::ThrottleState;
