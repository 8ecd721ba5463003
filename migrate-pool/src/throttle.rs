use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Per-source throttle bookkeeping. `until` is the instant at which the
/// penalty clears; `last_retry_after` and `throttle_count` are kept for
/// observability only.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleState {
    pub until: Instant,
    pub last_retry_after: Duration,
    pub throttle_count: u32,
}

/// Concurrent map of `source_name -> ThrottleState`. Reads and writes happen
/// from many batches at once; a single `RwLock` over the map is enough
/// striping for the identity counts this pool deals with (single digits to
/// low tens of sources), matching the "interior mutex or lock-striped map"
/// guidance without the complexity of real per-key striping.
#[derive(Default)]
pub struct ThrottleTracker {
    states: RwLock<HashMap<String, ThrottleState>>,
}

impl ThrottleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a throttle signal against `source`. Never shortens an
    /// existing penalty: `until = max(existing_until, now + retry_after)`.
    pub fn record(&self, source: &str, retry_after: Duration, now: Instant) {
        let candidate_until = now + retry_after;
        let mut states = self.states.write().expect("throttle tracker lock poisoned");
        let entry = states.entry(source.to_owned()).or_insert(ThrottleState {
            until: candidate_until,
            last_retry_after: retry_after,
            throttle_count: 0,
        });
        entry.until = entry.until.max(candidate_until);
        entry.last_retry_after = retry_after;
        entry.throttle_count += 1;
    }

    pub fn is_throttled(&self, source: &str, now: Instant) -> bool {
        self.states
            .read()
            .expect("throttle tracker lock poisoned")
            .get(source)
            .is_some_and(|state| now < state.until)
    }

    /// The shortest remaining wait across all currently-throttled sources,
    /// or `None` if no source is throttled.
    pub fn soonest_clear(&self, now: Instant) -> Option<Duration> {
        self.states
            .read()
            .expect("throttle tracker lock poisoned")
            .values()
            .filter(|state| now < state.until)
            .map(|state| state.until - now)
            .min()
    }

    /// Drops bookkeeping for sources whose penalty has already cleared.
    /// Purely a memory-hygiene operation; `is_throttled` already treats an
    /// expired entry as not-throttled without this being called.
    pub fn clear_expired(&self, now: Instant) {
        self.states
            .write()
            .expect("throttle tracker lock poisoned")
            .retain(|_, state| now < state.until);
    }

    pub fn throttle_count(&self, source: &str) -> u32 {
        self.states
            .read()
            .expect("throttle tracker lock poisoned")
            .get(source)
            .map(|state| state.throttle_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_never_shortens_an_existing_penalty() {
        let tracker = ThrottleTracker::new();
        let now = Instant::now();
        tracker.record("a", Duration::from_secs(30), now);
        let first_until = tracker.soonest_clear(now).unwrap();

        // A shorter retry_after arriving later must not shorten the penalty.
        tracker.record("a", Duration::from_secs(1), now);
        let second_until = tracker.soonest_clear(now).unwrap();

        assert!(second_until >= first_until - Duration::from_millis(1));
    }

    #[test]
    fn is_throttled_false_after_expiry() {
        let tracker = ThrottleTracker::new();
        let now = Instant::now();
        tracker.record("a", Duration::from_millis(10), now);
        assert!(tracker.is_throttled("a", now));
        assert!(!tracker.is_throttled("a", now + Duration::from_millis(11)));
    }

    #[test]
    fn soonest_clear_picks_the_minimum_across_sources() {
        let tracker = ThrottleTracker::new();
        let now = Instant::now();
        tracker.record("a", Duration::from_secs(30), now);
        tracker.record("b", Duration::from_secs(5), now);

        let soonest = tracker.soonest_clear(now).unwrap();
        assert!(soonest <= Duration::from_secs(5) && soonest > Duration::from_secs(4));
    }

    #[test]
    fn throttle_count_increments_per_record_call() {
        let tracker = ThrottleTracker::new();
        let now = Instant::now();
        tracker.record("a", Duration::from_secs(1), now);
        tracker.record("a", Duration::from_secs(1), now);
        assert_eq!(tracker.throttle_count("a"), 2);
    }
}
