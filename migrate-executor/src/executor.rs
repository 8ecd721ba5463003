use std::time::{Duration, Instant};

use migrate_common::{EntityOutcome, ErrorKind, Metrics, Operation, ProgressSink, Record, RecordError};
use migrate_pool::{CallOptions, ClientError, ConnectionPool, ServiceErrorKind};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::batch::partition;
use crate::capability::CapabilityCache;
use crate::error::ExecutorError;
use crate::options::ExecuteOptions;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_TRANSIENT_ATTEMPTS: u32 = 5;

fn jittered_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1).min(16));
    let base = BACKOFF_BASE.saturating_mul(exp).min(BACKOFF_CAP);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = (base.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
    Duration::from_millis(millis).min(BACKOFF_CAP)
}

fn map_service_error_kind(kind: ServiceErrorKind) -> ErrorKind {
    match kind {
        ServiceErrorKind::Throttled => ErrorKind::Throttled,
        ServiceErrorKind::BulkNotSupportedOnEntity => ErrorKind::BulkNotSupportedOnEntity,
        ServiceErrorKind::ReferenceNotFound => ErrorKind::ReferenceNotFound,
        ServiceErrorKind::DuplicateRecord => ErrorKind::DuplicateRecord,
        ServiceErrorKind::RequiredFieldMissing => ErrorKind::RequiredFieldMissing,
        ServiceErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        ServiceErrorKind::TransientNetwork => ErrorKind::TransientNetwork,
        ServiceErrorKind::Unknown => ErrorKind::Unknown,
    }
}

enum Probe {
    Supported(EntityOutcome),
    Unsupported,
}

/// Batches requests, probes bulk capability once per `entity`/`operation`,
/// and falls back to per-record operations when bulk isn't supported. The
/// pool's admission semaphore is the only concurrency limiter; this type
/// never pre-computes its own parallelism budget beyond bounding the number
/// of in-flight batches it submits at once.
pub struct BulkOperationExecutor {
    pool: ConnectionPool,
    capabilities: CapabilityCache,
    metrics: Metrics,
}

impl BulkOperationExecutor {
    pub fn new(pool: ConnectionPool, metrics: Metrics) -> Self {
        Self {
            pool,
            capabilities: CapabilityCache::new(),
            metrics,
        }
    }

    fn max_parallel(&self) -> usize {
        let cpu_bound = (num_cpus::get() as u32).saturating_mul(4);
        cpu_bound.min(self.pool.total_parallelism()).max(1) as usize
    }

    pub async fn execute_batches(
        &self,
        entity: &str,
        op: Operation,
        mut records: Vec<Record>,
        options: &ExecuteOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, ExecutorError> {
        let start = Instant::now();
        let mut outcome = EntityOutcome::new(entity);

        if options.strip_owner_fields {
            for record in &mut records {
                record.strip_owner_fields();
            }
        }

        if records.is_empty() {
            outcome.duration = start.elapsed();
            return Ok(outcome);
        }

        // batch_size = 1 degenerates to per-record mode without invoking the probe.
        let per_record_only = options.batch_size <= 1;

        let (bulk_supported, already_sent) = if per_record_only {
            (false, false)
        } else {
            match self.capabilities.get(entity, op) {
                Some(supported) => (supported, false),
                None => match self.probe(entity, op, &records[0], options, cancel).await? {
                    Probe::Supported(probe_outcome) => {
                        self.capabilities.set(entity, op, true);
                        outcome.merge(probe_outcome);
                        (true, true)
                    }
                    Probe::Unsupported => {
                        self.capabilities.set(entity, op, false);
                        progress.info(format!("{entity} does not support bulk operations; falling back to per-record"));
                        (false, false)
                    }
                },
            }
        };

        let remaining = if already_sent { &records[1..] } else { &records[..] };

        let tail_outcome = if bulk_supported {
            let batches = partition(remaining, options.batch_size);
            self.run_bulk(entity, op, &batches, options, cancel).await?
        } else {
            self.run_per_record(entity, op, remaining, options, cancel).await?
        };
        outcome.merge(tail_outcome);

        outcome.duration = start.elapsed();
        self.metrics.time_duration("executor.entity_duration", outcome.duration);
        Ok(outcome)
    }

    async fn probe(
        &self,
        entity: &str,
        op: Operation,
        first: &Record,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Probe, ExecutorError> {
        let call_options = CallOptions {
            bypass_plugins: options.bypass_plugins,
            bypass_flows: options.bypass_flows,
        };
        let mut transient_attempts = 0;
        let mut throttle_attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutorError::cancelled());
            }
            let mut client = match self.pool.acquire(cancel).await {
                Ok(client) => client,
                Err(e) if e.is_cancelled() => return Err(ExecutorError::cancelled()),
                Err(e) => {
                    return Ok(Probe::Supported(self.outcome_of_gaveup_batch(
                        entity,
                        std::slice::from_ref(first),
                        e.error_kind(),
                        &e.to_string(),
                    )));
                }
            };
            let send = client.send_bulk(entity, op, std::slice::from_ref(first), &call_options);
            match tokio::time::timeout(options.network_timeout, send).await {
                Ok(Ok(response)) => {
                    let outcome0 = &response.outcomes[0];
                    if let Some(error) = &outcome0.error {
                        if error.kind == ServiceErrorKind::BulkNotSupportedOnEntity {
                            return Ok(Probe::Unsupported);
                        }
                        if error.kind == ServiceErrorKind::Throttled {
                            if let Some(retry_after) = error.retry_after {
                                self.pool.record_throttle(client.source_name(), retry_after);
                            }
                            drop(client);
                            throttle_attempts += 1;
                            if throttle_attempts >= options.max_batch_retries {
                                // Couldn't determine capability; assume bulk is
                                // supported so the rest of the records still get
                                // the batched path, and record this one as a
                                // throttle failure like any other gave-up batch.
                                return Ok(Probe::Supported(self.outcome_of_gaveup_batch(
                                    entity,
                                    std::slice::from_ref(first),
                                    ErrorKind::Throttled,
                                    "probe exceeded max_batch_retries after repeated throttling",
                                )));
                            }
                            continue;
                        }
                    }
                    return Ok(Probe::Supported(self.outcome_from_bulk(entity, std::slice::from_ref(first), &response)));
                }
                Ok(Err(ClientError::Transient(_))) => {
                    client.poison();
                    drop(client);
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(ExecutorError::batch_retries_exhausted(entity, transient_attempts));
                    }
                    tokio::time::sleep(jittered_backoff(transient_attempts)).await;
                }
                Ok(Err(ClientError::Invalid)) => {
                    client.poison();
                    drop(client);
                }
                Err(_elapsed) => {
                    client.poison();
                    drop(client);
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(ExecutorError::batch_retries_exhausted(entity, transient_attempts));
                    }
                    tokio::time::sleep(jittered_backoff(transient_attempts)).await;
                }
            }
        }
    }

    async fn run_bulk(
        &self,
        entity: &str,
        op: Operation,
        batches: &[&[Record]],
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, ExecutorError> {
        let mut outcome = EntityOutcome::new(entity);
        let max_parallel = self.max_parallel();
        let mut abort = false;

        for group in batches.chunks(max_parallel) {
            if abort || cancel.is_cancelled() {
                if cancel.is_cancelled() {
                    return Err(ExecutorError::cancelled());
                }
                break;
            }
            let futures = group
                .iter()
                .map(|batch| self.send_bulk_batch_with_retry(entity, op, batch, options, cancel));
            let results = futures::future::join_all(futures).await;
            for result in results {
                let batch_outcome = result?;
                if !options.continue_on_error && batch_outcome.failure_count > 0 {
                    abort = true;
                }
                outcome.merge(batch_outcome);
            }
        }
        Ok(outcome)
    }

    async fn send_bulk_batch_with_retry(
        &self,
        entity: &str,
        op: Operation,
        batch: &[Record],
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, ExecutorError> {
        let call_options = CallOptions {
            bypass_plugins: options.bypass_plugins,
            bypass_flows: options.bypass_flows,
        };
        let mut throttle_attempts = 0;
        let mut transient_attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ExecutorError::cancelled());
            }
            let mut client = match self.pool.acquire(cancel).await {
                Ok(client) => client,
                Err(e) if e.is_cancelled() => return Err(ExecutorError::cancelled()),
                Err(e) => return Ok(self.outcome_of_gaveup_batch(entity, batch, e.error_kind(), &e.to_string())),
            };
            let send = client.send_bulk(entity, op, batch, &call_options);
            match tokio::time::timeout(options.network_timeout, send).await {
                Ok(Ok(response)) => {
                    let retry_after = response.outcomes.iter().find_map(|o| {
                        o.error
                            .as_ref()
                            .filter(|e| e.kind == ServiceErrorKind::Throttled)
                            .and_then(|e| e.retry_after)
                    });
                    if let Some(retry_after) = retry_after {
                        self.pool.record_throttle(client.source_name(), retry_after);
                        drop(client);
                        throttle_attempts += 1;
                        if throttle_attempts >= options.max_batch_retries {
                            return Ok(self.outcome_of_gaveup_batch(entity, batch, ErrorKind::Throttled, "batch exceeded max_batch_retries after repeated throttling"));
                        }
                        continue;
                    }
                    return Ok(self.outcome_from_bulk(entity, batch, &response));
                }
                Ok(Err(ClientError::Transient(message))) => {
                    client.poison();
                    drop(client);
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Ok(self.outcome_of_gaveup_batch(entity, batch, ErrorKind::TransientNetwork, &message));
                    }
                    tokio::time::sleep(jittered_backoff(transient_attempts)).await;
                }
                Ok(Err(ClientError::Invalid)) => {
                    client.poison();
                    drop(client);
                }
                Err(_elapsed) => {
                    client.poison();
                    drop(client);
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Ok(self.outcome_of_gaveup_batch(entity, batch, ErrorKind::TransientNetwork, "network_timeout elapsed before the service responded"));
                    }
                    tokio::time::sleep(jittered_backoff(transient_attempts)).await;
                }
            }
        }
    }

    async fn run_per_record(
        &self,
        entity: &str,
        op: Operation,
        records: &[Record],
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, ExecutorError> {
        let mut outcome = EntityOutcome::new(entity);
        let max_parallel = self.max_parallel();
        let mut abort = false;

        for group in records.chunks(max_parallel) {
            if abort || cancel.is_cancelled() {
                if cancel.is_cancelled() {
                    return Err(ExecutorError::cancelled());
                }
                break;
            }
            let futures = group
                .iter()
                .map(|record| self.send_single_with_retry(entity, op, record, options, cancel));
            let results = futures::future::join_all(futures).await;
            for result in results {
                let record_outcome = result?;
                if !options.continue_on_error && record_outcome.failure_count > 0 {
                    abort = true;
                }
                outcome.merge(record_outcome);
            }
        }
        Ok(outcome)
    }

    async fn send_single_with_retry(
        &self,
        entity: &str,
        op: Operation,
        record: &Record,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, ExecutorError> {
        let call_options = CallOptions {
            bypass_plugins: options.bypass_plugins,
            bypass_flows: options.bypass_flows,
        };
        let mut throttle_attempts = 0;
        let mut transient_attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ExecutorError::cancelled());
            }
            let mut client = match self.pool.acquire(cancel).await {
                Ok(client) => client,
                Err(e) if e.is_cancelled() => return Err(ExecutorError::cancelled()),
                Err(e) => {
                    return Ok(self.outcome_of_gaveup_batch(
                        entity,
                        std::slice::from_ref(record),
                        e.error_kind(),
                        &e.to_string(),
                    ));
                }
            };
            let send = client.send_single(entity, op, record, &call_options);
            match tokio::time::timeout(options.network_timeout, send).await {
                Ok(Ok(response)) => {
                    if let Some(error) = &response.error {
                        if error.kind == ServiceErrorKind::Throttled {
                            if let Some(retry_after) = error.retry_after {
                                self.pool.record_throttle(client.source_name(), retry_after);
                            }
                            drop(client);
                            throttle_attempts += 1;
                            if throttle_attempts >= options.max_batch_retries {
                                return Ok(self.outcome_of_gaveup_batch(entity, std::slice::from_ref(record), ErrorKind::Throttled, "record exceeded max_batch_retries after repeated throttling"));
                            }
                            continue;
                        }
                    }
                    let mut outcome = EntityOutcome::new(entity);
                    outcome.records_processed = 1;
                    if response.success {
                        outcome.success_count = 1;
                    } else {
                        outcome.failure_count = 1;
                        let error = response.error.expect("failed response without an error");
                        let mut record_error = RecordError::new(entity, map_service_error_kind(error.kind), error.message);
                        if let Some(record_id) = response.record_id {
                            record_error = record_error.with_record_id(record_id);
                        }
                        if let Some(field) = error.field {
                            record_error = record_error.with_field(field);
                        }
                        outcome.errors.push(record_error);
                    }
                    return Ok(outcome);
                }
                Ok(Err(ClientError::Transient(message))) => {
                    client.poison();
                    drop(client);
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Ok(self.outcome_of_gaveup_batch(entity, std::slice::from_ref(record), ErrorKind::TransientNetwork, &message));
                    }
                    tokio::time::sleep(jittered_backoff(transient_attempts)).await;
                }
                Ok(Err(ClientError::Invalid)) => {
                    client.poison();
                    drop(client);
                }
                Err(_elapsed) => {
                    client.poison();
                    drop(client);
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Ok(self.outcome_of_gaveup_batch(
                            entity,
                            std::slice::from_ref(record),
                            ErrorKind::TransientNetwork,
                            "network_timeout elapsed before the service responded",
                        ));
                    }
                    tokio::time::sleep(jittered_backoff(transient_attempts)).await;
                }
            }
        }
    }

    fn outcome_from_bulk(&self, entity: &str, batch: &[Record], response: &migrate_pool::BulkResponse) -> EntityOutcome {
        let mut outcome = EntityOutcome::new(entity);
        outcome.records_processed = batch.len() as u64;
        for record_outcome in &response.outcomes {
            if record_outcome.success {
                outcome.success_count += 1;
            } else {
                outcome.failure_count += 1;
                let error = record_outcome
                    .error
                    .as_ref()
                    .expect("failed record outcome without an error");
                let mut record_error =
                    RecordError::new(entity, map_service_error_kind(error.kind), error.message.clone());
                if let Some(record_id) = record_outcome.record_id.clone() {
                    record_error = record_error.with_record_id(record_id);
                }
                if let Some(field) = error.field.clone() {
                    record_error = record_error.with_field(field);
                }
                outcome.errors.push(record_error);
            }
        }
        outcome
    }

    fn outcome_of_gaveup_batch(&self, entity: &str, batch: &[Record], kind: ErrorKind, message: &str) -> EntityOutcome {
        let mut outcome = EntityOutcome::new(entity);
        outcome.records_processed = batch.len() as u64;
        outcome.failure_count = batch.len() as u64;
        outcome.errors = batch
            .iter()
            .map(|record| {
                let mut error = RecordError::new(entity, kind, message);
                if let Some(id) = record.id() {
                    error = error.with_record_id(id);
                }
                error
            })
            .collect();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrate_common::NullProgressSink;
    use migrate_pool::mock::MockServiceClient;
    use migrate_pool::{PoolConfig, StaticTokenSource};
    use serde_json::Value;
    use std::sync::Arc;

    fn record(id: &str) -> Record {
        let mut record = Record::new();
        record.insert("id", Value::String(id.into()));
        record
    }

    fn executor_with(client: MockServiceClient, max_dop: u32) -> (BulkOperationExecutor, MockServiceClient) {
        let source = Arc::new(StaticTokenSource::new("a", Box::new(client.clone()), max_dop));
        let pool = ConnectionPool::new(vec![source], PoolConfig::default());
        (BulkOperationExecutor::new(pool, Metrics::noop()), client)
    }

    #[tokio::test]
    async fn happy_path_bulk_batches_all_succeed() {
        let (executor, client) = executor_with(MockServiceClient::new("a"), 4);
        let records: Vec<Record> = (0..2500).map(|i| record(&format!("r{i}"))).collect();
        let options = ExecuteOptions::default();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("execute_batches");

        assert_eq!(outcome.records_processed, 2500);
        assert_eq!(outcome.success_count, 2500);
        assert_eq!(outcome.failure_count, 0);
        assert_eq!(client.stored_record_count(), 2500);
    }

    #[tokio::test]
    async fn bulk_unsupported_falls_back_to_per_record_for_all_records() {
        let client = MockServiceClient::new("a");
        client.mark_bulk_unsupported("contact");
        let (executor, client) = executor_with(client, 4);
        let records: Vec<Record> = (0..10).map(|i| record(&format!("r{i}"))).collect();
        let options = ExecuteOptions::default();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("execute_batches");

        assert_eq!(outcome.success_count, 10);
        assert_eq!(client.stored_record_count(), 10);
    }

    #[tokio::test]
    async fn batch_size_one_skips_the_probe_and_uses_per_record_mode() {
        let client = MockServiceClient::new("a");
        let (executor, client) = executor_with(client, 4);
        let records: Vec<Record> = (0..3).map(|i| record(&format!("r{i}"))).collect();
        let options = ExecuteOptions {
            batch_size: 1,
            ..ExecuteOptions::default()
        };
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("execute_batches");

        assert_eq!(outcome.success_count, 3);
        assert_eq!(client.stored_record_count(), 3);
    }

    #[tokio::test]
    async fn throttle_is_retried_and_eventually_succeeds() {
        let client = MockServiceClient::new("a");
        client.throttle_entity("contact", 2);
        let (executor, client) = executor_with(client, 4);
        let records = vec![record("r1")];
        let options = ExecuteOptions::default();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("execute_batches");

        assert_eq!(outcome.success_count, 1);
        assert_eq!(client.stored_record_count(), 1);
    }

    #[tokio::test]
    async fn throttle_beyond_max_batch_retries_is_recorded_as_a_failure() {
        let client = MockServiceClient::new("a");
        client.throttle_entity("contact", 100);
        let (executor, _client) = executor_with(client, 4);
        let records = vec![record("r1")];
        let options = ExecuteOptions {
            max_batch_retries: 2,
            ..ExecuteOptions::default()
        };
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("execute_batches");

        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.errors[0].error_kind, ErrorKind::Throttled);
    }

    #[tokio::test]
    async fn pool_error_is_recorded_as_a_failure_instead_of_aborting_the_run() {
        let client = MockServiceClient::new("a");
        let source = Arc::new(StaticTokenSource::new("a", Box::new(client.clone()), 4));
        let pool = ConnectionPool::new(
            vec![source],
            PoolConfig {
                max_retry_after_tolerance: Some(Duration::from_millis(10)),
                ..PoolConfig::default()
            },
        );
        pool.record_throttle("a", Duration::from_secs(60));
        let executor = BulkOperationExecutor::new(pool, Metrics::noop());
        let records = vec![record("r1")];
        let options = ExecuteOptions::default();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("a pool error should surface as a failed record, not abort execute_batches");

        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.errors[0].error_kind, ErrorKind::ThrottleExceedsTolerance);
    }

    #[tokio::test(start_paused = true)]
    async fn network_timeout_is_enforced_and_recorded_as_transient() {
        // batch_size 1 skips the bulk-capability probe entirely, so the only
        // retry loop exercised here is `send_single_with_retry`.
        let client = MockServiceClient::new("a");
        client.delay_entity("contact", Duration::from_millis(50));
        let (executor, _client) = executor_with(client, 4);
        let records = vec![record("r1")];
        let options = ExecuteOptions {
            batch_size: 1,
            network_timeout: Duration::from_millis(5),
            ..ExecuteOptions::default()
        };
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute_batches("contact", Operation::Create, records, &options, &NullProgressSink, &cancel)
            .await
            .expect("a network timeout should be recorded as a failure, not abort execute_batches");

        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.errors[0].error_kind, ErrorKind::TransientNetwork);
    }
}
