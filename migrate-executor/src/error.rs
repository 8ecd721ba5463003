use backtrace::Backtrace;
use migrate_common::ErrorKind;
use migrate_pool::PoolError;
use thiserror::Error;

#[derive(Debug)]
pub struct ExecutorError {
    kind: ExecutorErrorKind,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
pub enum ExecutorErrorKind {
    #[error("failed to obtain a pooled client: {0}")]
    Pool(PoolError),
    #[error("batch against {entity} gave up after {attempts} attempts")]
    BatchRetriesExhausted { entity: String, attempts: u32 },
    #[error("execution was cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn batch_retries_exhausted(entity: impl Into<String>, attempts: u32) -> Self {
        ExecutorErrorKind::BatchRetriesExhausted {
            entity: entity.into(),
            attempts,
        }
        .into()
    }

    pub fn cancelled() -> Self {
        ExecutorErrorKind::Cancelled.into()
    }

    pub fn kind(&self) -> &ExecutorErrorKind {
        &self.kind
    }

    pub fn error_kind(&self) -> ErrorKind {
        match &self.kind {
            ExecutorErrorKind::Pool(inner) => inner.error_kind(),
            ExecutorErrorKind::BatchRetriesExhausted { .. } => ErrorKind::Throttled,
            ExecutorErrorKind::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ExecutorErrorKind::Cancelled)
            || matches!(&self.kind, ExecutorErrorKind::Pool(inner) if inner.is_cancelled())
    }
}

impl From<ExecutorErrorKind> for ExecutorError {
    fn from(kind: ExecutorErrorKind) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

migrate_common::from_error!(PoolError, ExecutorError, ExecutorErrorKind::Pool);
migrate_common::impl_fmt_display!(ExecutorError, ExecutorErrorKind);

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
