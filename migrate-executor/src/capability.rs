use std::collections::HashMap;
use std::sync::RwLock;

use migrate_common::Operation;

/// `(entity, operation) -> bulk_supported?`, populated on first use by
/// probing with a single record and never reconsidered afterward. Not
/// persisted across runs: server capabilities may differ across
/// environments.
#[derive(Default)]
pub struct CapabilityCache {
    supported: RwLock<HashMap<(String, Operation), bool>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &str, op: Operation) -> Option<bool> {
        self.supported
            .read()
            .expect("capability cache lock poisoned")
            .get(&(entity.to_owned(), op))
            .copied()
    }

    pub fn set(&self, entity: &str, op: Operation, supported: bool) {
        self.supported
            .write()
            .expect("capability cache lock poisoned")
            .insert((entity.to_owned(), op), supported);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_none_until_set() {
        let cache = CapabilityCache::new();
        assert_eq!(cache.get("contact", Operation::Create), None);
        cache.set("contact", Operation::Create, false);
        assert_eq!(cache.get("contact", Operation::Create), Some(false));
    }

    #[test]
    fn keys_are_distinct_per_operation() {
        let cache = CapabilityCache::new();
        cache.set("contact", Operation::Create, true);
        assert_eq!(cache.get("contact", Operation::Update), None);
    }
}
