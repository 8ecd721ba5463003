use std::io;

use slog::{slog_o, Drain};
use slog_mozlog_json::MozLogJson;

/// Initializes the process-wide structured logger and bridges the `log`
/// facade through it, so library code using `log::info!` still reaches the
/// same drain as code using `slog`'s own macros.
///
/// `human_logs = true` selects a human-readable terminal drain for local
/// runs; `false` selects a mozlog-shaped JSON drain suitable for piping into
/// log aggregation.
pub fn init_logging(human_logs: bool) {
    let logger = if human_logs {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    } else {
        let drain = MozLogJson::new(io::stdout())
            .logger_name(format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
            .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
            .build()
            .fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    };

    // slog_scope's NoGlobalLoggerSet guard would panic on a second call
    // (e.g. across tests); cancel_reset() lets reset_logging() below take over.
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
}

/// Restores a discarding logger. Primarily useful for test teardown so one
/// test's logger doesn't leak into the next.
pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, slog_o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}
