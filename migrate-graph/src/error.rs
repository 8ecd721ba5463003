use backtrace::Backtrace;
use thiserror::Error;

#[derive(Debug)]
pub struct GraphError {
    kind: GraphErrorKind,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
pub enum GraphErrorKind {
    #[error("relationship on entity {entity:?} targets unknown entity {target:?}")]
    UnknownTarget { entity: String, target: String },
    #[error("schema declares no entities")]
    EmptySchema,
}

impl GraphError {
    pub fn unknown_target(entity: impl Into<String>, target: impl Into<String>) -> Self {
        GraphErrorKind::UnknownTarget {
            entity: entity.into(),
            target: target.into(),
        }
        .into()
    }

    pub fn empty_schema() -> Self {
        GraphErrorKind::EmptySchema.into()
    }

    pub fn kind(&self) -> &GraphErrorKind {
        &self.kind
    }
}

impl From<GraphErrorKind> for GraphError {
    fn from(kind: GraphErrorKind) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

migrate_common::impl_fmt_display!(GraphError, GraphErrorKind);

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
