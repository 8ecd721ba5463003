//! An in-memory [`ServiceClient`] used to drive this crate's own tests (and
//! re-exported for the executor/importer/CLI test suites to build on), with
//! knobs to inject throttles, bulk-unsupported responses, and transient
//! errors without a real network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use migrate_common::{Operation, Record};

use crate::client::{
    BulkResponse, CallOptions, ClientError, RecordOutcome, ServiceClient, ServiceError,
    ServiceErrorKind, SingleResponse,
};

#[derive(Default)]
struct Scripted {
    /// Number of calls (per `entity`) that should still return `retry_after`.
    throttle_once: HashMap<String, u32>,
    /// Entities for which bulk is reported unsupported.
    bulk_unsupported: Vec<String>,
    /// Number of calls that should still fail as transient network errors.
    transient_failures: HashMap<String, u32>,
    /// Artificial delay applied before responding, per `entity`.
    response_delay: HashMap<String, Duration>,
}

/// Shared, clonable mock client. Every clone produced via `box_clone` shares
/// the same call counters and scripted behavior, the way a real pooled
/// client clone shares the identity's server-side state.
#[derive(Clone)]
pub struct MockServiceClient {
    source_name: String,
    calls: Arc<AtomicUsize>,
    records: Arc<Mutex<HashMap<String, Record>>>,
    scripted: Arc<Mutex<Scripted>>,
    valid: Arc<std::sync::atomic::AtomicBool>,
    max_dop: Arc<AtomicU32>,
}

impl std::fmt::Debug for MockServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServiceClient")
            .field("source_name", &self.source_name)
            .finish()
    }
}

impl MockServiceClient {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            records: Arc::new(Mutex::new(HashMap::new())),
            scripted: Arc::new(Mutex::new(Scripted::default())),
            valid: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            max_dop: Arc::new(AtomicU32::new(4)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stored_record_count(&self) -> usize {
        self.records.lock().expect("mock lock poisoned").len()
    }

    /// The next `count` calls against `entity` return a throttle error.
    pub fn throttle_entity(&self, entity: &str, count: u32) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .throttle_once
            .insert(entity.to_owned(), count);
    }

    pub fn mark_bulk_unsupported(&self, entity: &str) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .bulk_unsupported
            .push(entity.to_owned());
    }

    pub fn fail_transiently(&self, entity: &str, count: u32) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .transient_failures
            .insert(entity.to_owned(), count);
    }

    pub fn set_invalid(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Every call against `entity` sleeps for `delay` before responding.
    /// Used to exercise callers' own network timeouts without a real clock.
    pub fn delay_entity(&self, entity: &str, delay: Duration) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .response_delay
            .insert(entity.to_owned(), delay);
    }

    fn response_delay(&self, entity: &str) -> Option<Duration> {
        self.scripted.lock().expect("mock lock poisoned").response_delay.get(entity).copied()
    }

    fn take_transient_failure(&self, entity: &str) -> bool {
        let mut scripted = self.scripted.lock().expect("mock lock poisoned");
        if let Some(remaining) = scripted.transient_failures.get_mut(entity) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn take_throttle(&self, entity: &str) -> Option<Duration> {
        let mut scripted = self.scripted.lock().expect("mock lock poisoned");
        if let Some(remaining) = scripted.throttle_once.get_mut(entity) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(Duration::from_millis(50));
            }
        }
        None
    }

    fn bulk_unsupported(&self, entity: &str) -> bool {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .bulk_unsupported
            .iter()
            .any(|e| e == entity)
    }

    fn store(&self, entity: &str, record: &Record) -> Option<String> {
        let id = record
            .id()
            .unwrap_or_else(|| format!("{}-{}", entity, self.calls.load(Ordering::SeqCst)));
        self.records
            .lock()
            .expect("mock lock poisoned")
            .insert(format!("{}:{}", entity, id), record.clone());
        Some(id)
    }
}

#[async_trait]
impl ServiceClient for MockServiceClient {
    async fn send_bulk(
        &self,
        entity: &str,
        _op: Operation,
        records: &[Record],
        _options: &CallOptions,
    ) -> Result<BulkResponse, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.response_delay(entity) {
            tokio::time::sleep(delay).await;
        }

        if self.bulk_unsupported(entity) {
            return Ok(BulkResponse {
                outcomes: records
                    .iter()
                    .map(|r| RecordOutcome {
                        record_id: r.id(),
                        success: false,
                        error: Some(ServiceError {
                            kind: ServiceErrorKind::BulkNotSupportedOnEntity,
                            retry_after: None,
                            field: None,
                            message: "bulk operations are not supported for this entity".into(),
                        }),
                    })
                    .collect(),
            });
        }

        if self.take_transient_failure(entity) {
            return Err(ClientError::Transient("simulated transient failure".into()));
        }

        if let Some(retry_after) = self.take_throttle(entity) {
            return Ok(BulkResponse {
                outcomes: records
                    .iter()
                    .map(|r| RecordOutcome {
                        record_id: r.id(),
                        success: false,
                        error: Some(ServiceError {
                            kind: ServiceErrorKind::Throttled,
                            retry_after: Some(retry_after),
                            field: None,
                            message: "too many requests".into(),
                        }),
                    })
                    .collect(),
            });
        }

        let outcomes = records
            .iter()
            .map(|r| RecordOutcome {
                record_id: self.store(entity, r),
                success: true,
                error: None,
            })
            .collect();
        Ok(BulkResponse { outcomes })
    }

    async fn send_single(
        &self,
        entity: &str,
        _op: Operation,
        record: &Record,
        _options: &CallOptions,
    ) -> Result<SingleResponse, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.response_delay(entity) {
            tokio::time::sleep(delay).await;
        }

        if self.take_transient_failure(entity) {
            return Err(ClientError::Transient("simulated transient failure".into()));
        }

        if let Some(retry_after) = self.take_throttle(entity) {
            return Ok(SingleResponse {
                record_id: record.id(),
                success: false,
                error: Some(ServiceError {
                    kind: ServiceErrorKind::Throttled,
                    retry_after: Some(retry_after),
                    field: None,
                    message: "too many requests".into(),
                }),
            });
        }

        Ok(SingleResponse {
            record_id: self.store(entity, record),
            success: true,
            error: None,
        })
    }

    async fn validate(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn recommended_max_dop(&self) -> Option<u32> {
        Some(self.max_dop.load(Ordering::SeqCst))
    }

    fn box_clone(&self) -> Box<dyn ServiceClient> {
        Box::new(self.clone())
    }
}
