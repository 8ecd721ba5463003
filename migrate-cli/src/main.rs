//! Runnable entrypoint wiring the default collaborators together: a
//! filesystem schema/archive, a `LoggingProgressSink`, and a pool of sources
//! built from env-configured tokens, then drives a `TieredImporter` to
//! completion and prints the resulting summary.
//!
//! Grounded in `tools/migration_rs/src/main.rs`'s shape: settings, then
//! logging, then collaborators, then run.

#[macro_use]
extern crate slog_scope;

use std::process::ExitCode;
use std::sync::Arc;

use migrate_common::{metrics_from_opts, LoggingProgressSink, MetricsOpts};
use migrate_executor::BulkOperationExecutor;
use migrate_importer::{ImportOptions, JsonlArchive, TieredImporter};
use migrate_pool::mock::MockServiceClient;
use migrate_pool::{ConnectionPool, ConnectionSource, PoolConfig, StaticTokenSource};
use migrate_settings::Settings;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

#[derive(StructOpt, Debug)]
#[structopt(name = "migrate")]
struct Flags {
    /// Path to an optional TOML/JSON settings file.
    #[structopt(long)]
    config: Option<String>,

    /// Directory holding schema.json and the <entity>.jsonl record files.
    #[structopt(long)]
    archive: String,

    /// Overrides `human_logs` for this run regardless of settings.
    #[structopt(long)]
    human_logs: bool,
}

fn build_sources(settings: &Settings) -> Vec<Arc<dyn ConnectionSource>> {
    // No concrete HTTP `ServiceClient` implementation ships with this crate;
    // a real deployment supplies one that authenticates against the target
    // service and reads its throttle headers. The in-memory mock stands in
    // here so the binary is runnable end-to-end against a local fixture.
    let seed = Box::new(MockServiceClient::new("default"));
    let source = StaticTokenSource::new("default", seed, settings.pool.max_connections_per_identity);
    vec![Arc::new(source)]
}

#[tokio::main]
async fn main() -> ExitCode {
    let flags = Flags::from_args();

    let settings = match Settings::with_env_and_config_file(flags.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    migrate_common::logging::init_logging(flags.human_logs || settings.human_logs);

    let metrics = metrics_from_opts(&MetricsOpts {
        statsd_host: settings.statsd_host.as_deref(),
        statsd_port: settings.statsd_port,
        label: &settings.statsd_label,
    })
    .unwrap_or_else(|e| {
        warn!("failed to initialize metrics, falling back to no-op: {:?}", e);
        migrate_common::Metrics::noop()
    });

    let pool_config = PoolConfig {
        acquire_timeout: std::time::Duration::from_secs(settings.pool.acquire_timeout_secs),
        max_retry_after_tolerance: settings
            .pool
            .max_retry_after_tolerance_secs
            .map(std::time::Duration::from_secs),
        selection_strategy: settings.pool.selection_strategy,
    };
    let pool = ConnectionPool::new(build_sources(&settings), pool_config);

    let executor = BulkOperationExecutor::new(pool, metrics);
    let importer = TieredImporter::new(executor);

    let archive = JsonlArchive::new(&flags.archive);
    let progress = LoggingProgressSink;
    let cancel = CancellationToken::new();

    let import_options = ImportOptions {
        import_mode: settings.importer.import_mode,
        continue_on_error: settings.importer.executor.continue_on_error,
        user_mapping: None,
        execute: migrate_executor::ExecuteOptions {
            batch_size: settings.importer.executor.batch_size,
            continue_on_error: settings.importer.executor.continue_on_error,
            bypass_plugins: settings.importer.executor.bypass_plugins,
            bypass_flows: settings.importer.executor.bypass_flows,
            strip_owner_fields: settings.importer.executor.strip_owner_fields,
            max_batch_retries: settings.importer.executor.max_batch_retries,
            network_timeout: std::time::Duration::from_secs(settings.importer.executor.network_timeout_secs),
        },
    };

    match importer.run(&archive, &import_options, &progress, &cancel).await {
        Ok(result) => {
            println!(
                "migration complete: {} processed, {} succeeded, {} failed in {:?}",
                result.records_processed, result.success_count, result.failure_count, result.duration
            );
            if result.failure_count > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("migration failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
