//! Shared domain types, error-kind classification, logging, and metrics used by every
//! crate in the migration data plane: the pool, the executor, the graph builder, and
//! the tiered importer all build their own `{Crate}Error` on top of [`ErrorKind`].

#[macro_use]
extern crate slog_scope;

pub mod logging;
pub mod metrics;
pub mod progress;
pub mod record;
pub mod result;

mod error_kind;

pub use error_kind::{ErrorKind, RecordError};
pub use metrics::{metrics_from_opts, MetricError, Metrics, MetricsOpts};
pub use progress::{LoggingProgressSink, NullProgressSink, PhaseKind, ProgressEvent, ProgressSink};
pub use record::{Operation, Record, RecordId};
pub use result::{EntityOutcome, MigrationResult};

/// Absolute ceiling on the degree of parallelism the pool will grant a single
/// identity, regardless of what the service recommends.
pub const HARD_LIMIT_PER_IDENTITY: u32 = 52;

/// Generates a `From` impl that wraps a lower-level error into one arm of a
/// higher-level error kind, so call sites can use `?` across crate boundaries
/// instead of `.map_err(...)` boilerplate.
#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

/// Forwards `Display` for an opaque `{Crate}Error` struct to its private kind enum.
#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl std::fmt::Display for $error {
            fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}
