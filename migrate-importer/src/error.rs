use backtrace::Backtrace;
use migrate_common::ErrorKind;
use migrate_executor::ExecutorError;
use migrate_graph::GraphError;
use thiserror::Error;

use crate::archive::ArchiveError;

#[derive(Debug)]
pub struct ImporterError {
    kind: ImporterErrorKind,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
pub enum ImporterErrorKind {
    #[error("failed to execute entity batches: {0}")]
    Executor(ExecutorError),
    #[error("failed to build the dependency graph: {0}")]
    Graph(GraphError),
    #[error("failed to read the archive: {0}")]
    Archive(ArchiveError),
    #[error("import was cancelled")]
    Cancelled,
}

impl ImporterError {
    pub fn cancelled() -> Self {
        ImporterErrorKind::Cancelled.into()
    }

    pub fn kind(&self) -> &ImporterErrorKind {
        &self.kind
    }

    pub fn error_kind(&self) -> ErrorKind {
        match &self.kind {
            ImporterErrorKind::Executor(inner) => inner.error_kind(),
            ImporterErrorKind::Graph(_) => ErrorKind::Unknown,
            ImporterErrorKind::Archive(_) => ErrorKind::Unknown,
            ImporterErrorKind::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ImporterErrorKind::Cancelled)
            || matches!(&self.kind, ImporterErrorKind::Executor(inner) if inner.is_cancelled())
    }
}

impl From<ImporterErrorKind> for ImporterError {
    fn from(kind: ImporterErrorKind) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

migrate_common::from_error!(ExecutorError, ImporterError, ImporterErrorKind::Executor);
migrate_common::from_error!(GraphError, ImporterError, ImporterErrorKind::Graph);
migrate_common::from_error!(ArchiveError, ImporterError, ImporterErrorKind::Archive);
migrate_common::impl_fmt_display!(ImporterError, ImporterErrorKind);

impl std::error::Error for ImporterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
