use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error_kind::{ErrorKind, RecordError};

/// Outcome of driving a single entity through the executor, whether from a
/// tier pass or the deferred-field pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity: String,
    pub records_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub errors: Vec<RecordError>,
}

impl EntityOutcome {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: EntityOutcome) {
        self.records_processed += other.records_processed;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.duration += other.duration;
        self.errors.extend(other.errors);
    }
}

/// The aggregate report a migration run produces, win or lose.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MigrationResult {
    pub records_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub errors: Vec<RecordError>,
    pub entities: Vec<EntityOutcome>,
}

impl MigrationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_entity(&mut self, outcome: EntityOutcome) {
        self.records_processed += outcome.records_processed;
        self.success_count += outcome.success_count;
        self.failure_count += outcome.failure_count;
        self.duration += outcome.duration;
        self.errors.extend(outcome.errors.iter().cloned());
        self.entities.push(outcome);
    }

    /// Frequency map of `error_kind -> count`, used externally to render
    /// actionable suggestions without the core knowing about UI concerns.
    pub fn error_patterns(&self) -> HashMap<ErrorKind, u64> {
        let mut patterns = HashMap::new();
        for error in &self.errors {
            *patterns.entry(error.error_kind).or_insert(0) += 1;
        }
        patterns
    }

    /// The single `ErrorKind` that accounts for the most failures, used to
    /// pick a "dominant" kind for a run summary (e.g. reporting `Cancelled`
    /// as the headline reason after a mid-run cancellation).
    pub fn dominant_error_kind(&self) -> Option<ErrorKind> {
        self.error_patterns()
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(kind, _)| kind)
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(duration.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_patterns_counts_by_kind() {
        let mut result = MigrationResult::new();
        result.errors.push(RecordError::new("contact", ErrorKind::Throttled, "x"));
        result.errors.push(RecordError::new("contact", ErrorKind::Throttled, "y"));
        result.errors.push(RecordError::new("account", ErrorKind::ReferenceNotFound, "z"));

        let patterns = result.error_patterns();
        assert_eq!(patterns.get(&ErrorKind::Throttled), Some(&2));
        assert_eq!(patterns.get(&ErrorKind::ReferenceNotFound), Some(&1));
    }

    #[test]
    fn dominant_error_kind_prefers_cancelled_when_most_common() {
        let mut result = MigrationResult::new();
        for _ in 0..3 {
            result.errors.push(RecordError::new("contact", ErrorKind::Cancelled, "cancelled"));
        }
        result.errors.push(RecordError::new("contact", ErrorKind::Unknown, "other"));

        assert_eq!(result.dominant_error_kind(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn merge_entity_accumulates_totals() {
        let mut result = MigrationResult::new();
        let mut a = EntityOutcome::new("account");
        a.records_processed = 10;
        a.success_count = 9;
        a.failure_count = 1;
        result.merge_entity(a);

        let mut b = EntityOutcome::new("contact");
        b.records_processed = 5;
        b.success_count = 5;
        result.merge_entity(b);

        assert_eq!(result.records_processed, 15);
        assert_eq!(result.success_count, 14);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.entities.len(), 2);
    }
}
