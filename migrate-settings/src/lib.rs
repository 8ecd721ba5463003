//! Layered configuration for the data-plane crates: one settings struct per
//! concern, loaded the way `syncserver-settings::Settings` is — an optional
//! file first, then an environment overlay.

#[macro_use]
extern crate slog_scope;

use config::{Config, ConfigError, Environment, File};
use migrate_importer::ImportMode;
use migrate_pool::SelectionStrategy;
use serde::Deserialize;

static PREFIX: &str = "MIGRATE";

/// Settings governing `ConnectionPool` construction and source admission.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub selection_strategy: SelectionStrategy,
    pub max_connections_per_identity: u32,
    pub acquire_timeout_secs: u64,
    pub max_retry_after_tolerance_secs: Option<u64>,
    /// Disables server-side node pinning on outgoing requests, for higher
    /// aggregate throughput across a pool of parallel clients. Consumed by
    /// a real `ServiceClient` implementation's request construction; the
    /// core pool has no notion of affinity cookies itself.
    pub disable_affinity_cookie: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::ThrottleAware,
            max_connections_per_identity: 52,
            acquire_timeout_secs: 120,
            max_retry_after_tolerance_secs: None,
            disable_affinity_cookie: true,
        }
    }
}

/// Settings governing `BulkOperationExecutor` batch execution.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub batch_size: usize,
    pub max_batch_retries: u32,
    pub continue_on_error: bool,
    pub strip_owner_fields: bool,
    pub bypass_plugins: bool,
    pub bypass_flows: bool,
    pub network_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_batch_retries: 5,
            continue_on_error: false,
            strip_owner_fields: false,
            bypass_plugins: false,
            bypass_flows: false,
            network_timeout_secs: 120,
        }
    }
}

/// Settings governing `TieredImporter` behavior, nesting the executor
/// settings it passes straight through to `execute_batches`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ImporterSettings {
    pub import_mode: ImportMode,
    pub executor: ExecutorSettings,
}

impl Default for ImporterSettings {
    fn default() -> Self {
        Self {
            import_mode: ImportMode::default(),
            executor: ExecutorSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub human_logs: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,

    pub pool: PoolSettings,
    pub importer: ImporterSettings,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            human_logs: true,
            statsd_host: None,
            statsd_port: 8125,
            statsd_label: "migrate".to_owned(),
            pool: PoolSettings::default(),
            importer: ImporterSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional config file, then overlays
    /// `MIGRATE_FOO__BAR_VALUE`-style environment variables.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        s.merge(Environment::with_prefix(PREFIX).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(settings) => Ok(settings),
            Err(ConfigError::Message(v)) => {
                error!("Configuration error: value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: {:?}", &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn environment_prefix_overrides_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("MIGRATE_POOL__MAX_CONNECTIONS_PER_IDENTITY", "12");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.pool.max_connections_per_identity, 12);
        env::remove_var("MIGRATE_POOL__MAX_CONNECTIONS_PER_IDENTITY");
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.pool.acquire_timeout_secs, 120);
        assert_eq!(settings.importer.executor.batch_size, 1000);
        assert_eq!(settings.importer.executor.max_batch_retries, 5);
        assert!(settings.pool.disable_affinity_cookie);
    }
}
