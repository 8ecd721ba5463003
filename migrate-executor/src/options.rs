use std::time::Duration;

/// Options controlling one `execute_batches` call. Mirrors the "pass-through
/// hints" the pooled client forwards untouched to the service.
#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    pub batch_size: usize,
    pub continue_on_error: bool,
    pub bypass_plugins: bool,
    pub bypass_flows: bool,
    pub strip_owner_fields: bool,
    pub max_batch_retries: u32,
    pub network_timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            continue_on_error: false,
            bypass_plugins: false,
            bypass_flows: false,
            strip_owner_fields: false,
            max_batch_retries: 5,
            network_timeout: Duration::from_secs(120),
        }
    }
}
