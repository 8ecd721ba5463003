use std::collections::HashMap;

use crate::error_kind::ErrorKind;
use crate::result::MigrationResult;

/// The phase of a migration run, surfaced to push-model progress sinks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhaseKind {
    Analyzing,
    Exporting,
    Importing,
    DeferredPass,
    Complete,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Analyzing => "analyzing",
            PhaseKind::Exporting => "exporting",
            PhaseKind::Importing => "importing",
            PhaseKind::DeferredPass => "deferred_pass",
            PhaseKind::Complete => "complete",
        }
    }
}

/// Events pushed to a [`ProgressSink`] over the life of a run. The core never
/// reads these back; they exist purely to let an external collaborator
/// (a CLI progress bar, a log stream, a UI) render what's happening.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Phase(PhaseKind, String),
    Progress {
        current: u64,
        total: u64,
        entity: Option<String>,
        rate: Option<f64>,
        eta: Option<std::time::Duration>,
    },
    Warning(String),
    Info(String),
    Error(ErrorKind, String, HashMap<String, String>),
    Complete(MigrationResult),
}

/// A push-model sink for progress events. Implementations must be cheap to
/// call from many concurrent batches; the core never waits on a sink.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);

    fn phase(&self, kind: PhaseKind, message: impl Into<String>) {
        self.on_event(ProgressEvent::Phase(kind, message.into()));
    }

    fn warn(&self, message: impl Into<String>) {
        self.on_event(ProgressEvent::Warning(message.into()));
    }

    fn info(&self, message: impl Into<String>) {
        self.on_event(ProgressEvent::Info(message.into()));
    }
}

/// Discards every event. Used by tests and by callers that only care about
/// the returned `MigrationResult`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Forwards every event to the process-wide structured logger at a level
/// appropriate to the event, the way `syncserver`'s request middleware logs
/// through `slog_scope`'s global logger rather than threading a `Logger`
/// through every call site.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase(kind, message) => {
                info!("phase"; "phase" => kind.as_str(), "message" => message);
            }
            ProgressEvent::Progress {
                current,
                total,
                entity,
                rate,
                eta,
            } => {
                info!(
                    "progress";
                    "current" => current,
                    "total" => total,
                    "entity" => entity.unwrap_or_default(),
                    "rate" => rate.unwrap_or_default(),
                    "eta_secs" => eta.map(|d| d.as_secs()).unwrap_or_default(),
                );
            }
            ProgressEvent::Warning(message) => warn!("{}", message),
            ProgressEvent::Info(message) => info!("{}", message),
            ProgressEvent::Error(kind, message, context) => {
                error!("migration error"; "kind" => kind.to_string(), "message" => message, "context" => format!("{:?}", context));
            }
            ProgressEvent::Complete(result) => {
                info!(
                    "complete";
                    "records_processed" => result.records_processed,
                    "success_count" => result.success_count,
                    "failure_count" => result.failure_count,
                );
            }
        }
    }
}
