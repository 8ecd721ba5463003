use std::collections::HashMap;
use std::time::Instant;

use migrate_common::{ErrorKind, MigrationResult, Operation, PhaseKind, ProgressEvent, ProgressSink, Record, RecordError};
use migrate_executor::BulkOperationExecutor;
use migrate_graph::DependencyGraph;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveReader;
use crate::error::ImporterError;
use crate::options::ImportOptions;

/// Executes a dependency-ordered import of a migration package: tiers run in
/// order, entities within a tier run in parallel, and a deferred-field pass
/// writes back the fields that were stripped to break circular references.
pub struct TieredImporter {
    executor: BulkOperationExecutor,
}

impl TieredImporter {
    pub fn new(executor: BulkOperationExecutor) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        archive: &dyn ArchiveReader,
        options: &ImportOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<MigrationResult, ImporterError> {
        let start = Instant::now();
        let mut result = MigrationResult::new();

        progress.phase(PhaseKind::Analyzing, "reading schema and building dependency graph");
        let schema = archive.read_schema()?;
        let graph = DependencyGraph::build(&schema)?;

        // entity -> {id, deferred_field_values} records awaiting the second pass.
        let mut side_log: HashMap<String, Vec<Record>> = HashMap::new();

        progress.phase(PhaseKind::Importing, "importing tiers");
        let mut cancelled = false;
        'tiers: for tier in graph.tiers() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut batches = Vec::with_capacity(tier.len());
            for entity in tier {
                let deferred_fields: Vec<String> = graph.deferred_fields_for(entity).into_iter().collect();
                let raw_records = archive.read_records(entity)?;

                let mut clean_records = Vec::with_capacity(raw_records.len());
                let mut deferred_for_entity = Vec::new();
                for mut record in raw_records {
                    if !deferred_fields.is_empty() {
                        deferred_for_entity.push(record.project(&deferred_fields));
                        for field in &deferred_fields {
                            record.remove(field);
                        }
                    }
                    if !options.execute.strip_owner_fields {
                        if let Some(mapping) = &options.user_mapping {
                            record.apply_user_mapping(|id| mapping(id));
                        }
                    }
                    // strip_owner_fields itself is applied inside execute_batches.
                    clean_records.push(record);
                }
                if !deferred_for_entity.is_empty() {
                    side_log.entry(entity.clone()).or_default().extend(deferred_for_entity);
                }

                batches.push(self.executor.execute_batches(
                    entity,
                    options.import_mode.into(),
                    clean_records,
                    &options.execute,
                    progress,
                    cancel,
                ));
            }

            let outcomes = futures::future::join_all(batches).await;
            let mut tier_failed = false;
            for outcome in outcomes {
                match outcome {
                    Ok(entity_outcome) => {
                        if entity_outcome.failure_count > 0 && !options.continue_on_error {
                            tier_failed = true;
                        }
                        result.merge_entity(entity_outcome);
                    }
                    Err(e) => {
                        if e.is_cancelled() {
                            cancelled = true;
                            break 'tiers;
                        }
                        if !options.continue_on_error {
                            return Err(e.into());
                        }
                        result.errors.push(RecordError::new("*", e.error_kind(), e.to_string()));
                        tier_failed = true;
                    }
                }
            }
            if tier_failed && !options.continue_on_error {
                break;
            }
        }

        if !cancelled {
            progress.phase(PhaseKind::DeferredPass, "writing deferred field values");
            for (entity, records) in side_log {
                if records.is_empty() || cancel.is_cancelled() {
                    continue;
                }
                match self
                    .executor
                    .execute_batches(&entity, Operation::Update, records, &options.execute, progress, cancel)
                    .await
                {
                    Ok(entity_outcome) => result.merge_entity(entity_outcome),
                    Err(e) => {
                        if e.is_cancelled() {
                            cancelled = true;
                        } else if !options.continue_on_error {
                            return Err(e.into());
                        } else {
                            result.errors.push(RecordError::new("*", e.error_kind(), e.to_string()));
                        }
                    }
                }
            }
        }

        if cancelled {
            result.errors.push(RecordError::new("*", ErrorKind::Cancelled, "import cancelled"));
        }

        result.duration = start.elapsed();
        progress.phase(PhaseKind::Complete, "migration complete");
        progress.on_event(ProgressEvent::Complete(result.clone()));
        Ok(result)
    }
}
