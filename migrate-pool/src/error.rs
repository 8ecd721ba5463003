use std::fmt;

use backtrace::Backtrace;
use migrate_common::ErrorKind;
use thiserror::Error;

/// Opaque pool error: a classification plus a captured backtrace, in the
/// same shape as this codebase's other `{Crate}Error` types.
#[derive(Debug)]
pub struct PoolError {
    kind: PoolErrorKind,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
pub enum PoolErrorKind {
    #[error("no client became available before the acquire timeout elapsed")]
    PoolExhausted,
    #[error("the soonest throttle clear exceeds the configured tolerance")]
    ThrottleExceedsTolerance,
    #[error("failed to obtain a usable connection: {0}")]
    ConnectionFailed(String),
    #[error("acquire was cancelled")]
    Cancelled,
}

impl PoolError {
    pub fn pool_exhausted() -> Self {
        PoolErrorKind::PoolExhausted.into()
    }

    pub fn throttle_exceeds_tolerance() -> Self {
        PoolErrorKind::ThrottleExceedsTolerance.into()
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        PoolErrorKind::ConnectionFailed(message.into()).into()
    }

    pub fn cancelled() -> Self {
        PoolErrorKind::Cancelled.into()
    }

    pub fn kind(&self) -> &PoolErrorKind {
        &self.kind
    }

    /// Maps this pool error onto the domain-level [`ErrorKind`] taxonomy
    /// carried in `MigrationResult.errors[].error_kind`.
    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            PoolErrorKind::PoolExhausted => ErrorKind::PoolExhausted,
            PoolErrorKind::ThrottleExceedsTolerance => ErrorKind::ThrottleExceedsTolerance,
            PoolErrorKind::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            PoolErrorKind::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Cancelled)
    }
}

impl From<PoolErrorKind> for PoolError {
    fn from(kind: PoolErrorKind) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

migrate_common::impl_fmt_display!(PoolError, PoolErrorKind);

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
