use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::client::ServiceClient;
use crate::error::PoolError;
use crate::source::ConnectionSource;
use crate::throttle::ThrottleTracker;

/// Source selection algorithm applied in Phase 3, always restricted to
/// sources that are currently non-throttled and have room under their DOP.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastInUse,
    /// Skip throttled sources; among the rest, round-robin. This is simply
    /// the default name for the behavior every strategy already has, since
    /// Phase 3 only ever selects among non-throttled sources.
    ThrottleAware,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::ThrottleAware
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub acquire_timeout: Duration,
    pub max_retry_after_tolerance: Option<Duration>,
    pub selection_strategy: SelectionStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(120),
            max_retry_after_tolerance: None,
            selection_strategy: SelectionStrategy::ThrottleAware,
        }
    }
}

struct SourceFreeState {
    free: VecDeque<Box<dyn ServiceClient>>,
    in_use: u32,
}

enum Claim {
    /// A free client was available; already counted against `in_use`.
    Existing(Box<dyn ServiceClient>),
    /// No free client, but there's room under `max_dop`; caller must create one.
    NeedNew,
    /// Source has no spare capacity right now.
    NoRoom,
    /// Source is currently throttled.
    Throttled,
}

struct SourceEntry {
    source: Arc<dyn ConnectionSource>,
    seed: Box<dyn ServiceClient>,
    state: Mutex<SourceFreeState>,
}

impl SourceEntry {
    fn try_claim(&self, throttled: bool) -> Claim {
        if throttled {
            return Claim::Throttled;
        }
        let mut state = self.state.lock().expect("source free-list lock poisoned");
        if let Some(client) = state.free.pop_front() {
            state.in_use += 1;
            return Claim::Existing(client);
        }
        if state.in_use < self.source.max_dop() {
            state.in_use += 1;
            return Claim::NeedNew;
        }
        Claim::NoRoom
    }

    fn abandon_claim(&self) {
        let mut state = self.state.lock().expect("source free-list lock poisoned");
        state.in_use = state.in_use.saturating_sub(1);
    }

    fn release(&self, client: Option<Box<dyn ServiceClient>>) {
        let mut state = self.state.lock().expect("source free-list lock poisoned");
        state.in_use = state.in_use.saturating_sub(1);
        if let Some(client) = client {
            state.free.push_back(client);
        }
    }

    fn in_use(&self) -> u32 {
        self.state.lock().expect("source free-list lock poisoned").in_use
    }
}

struct PoolInner {
    sources: Vec<SourceEntry>,
    throttle: ThrottleTracker,
    semaphore: Arc<Semaphore>,
    total_dop: u32,
    config: PoolConfig,
    rr_cursor: AtomicUsize,
    freed: Notify,
}

/// A multi-identity pool of long-lived authenticated clients with
/// throttle-aware selection, per-identity admission control, and
/// transparent waiting during throttle recovery. See module docs in
/// `migrate-pool`'s crate root for the three-phase acquisition algorithm.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(sources: Vec<Arc<dyn ConnectionSource>>, config: PoolConfig) -> Self {
        assert!(!sources.is_empty(), "pool requires at least one connection source");
        let total_dop: u32 = sources.iter().map(|s| s.max_dop()).sum();
        let entries = sources
            .into_iter()
            .map(|source| SourceEntry {
                seed: source.seed_client(),
                source,
                state: Mutex::new(SourceFreeState {
                    free: VecDeque::new(),
                    in_use: 0,
                }),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                sources: entries,
                throttle: ThrottleTracker::new(),
                semaphore: Arc::new(Semaphore::new(total_dop as usize)),
                total_dop,
                config,
                rr_cursor: AtomicUsize::new(0),
                freed: Notify::new(),
            }),
        }
    }

    /// Current sum of per-source DOPs. The executor derives its inner
    /// parallelism bound from this value; callers must never pre-compute
    /// their own parallelism from it beyond that.
    pub fn total_parallelism(&self) -> u32 {
        self.inner.total_dop
    }

    pub fn record_throttle(&self, source_name: &str, retry_after: Duration) {
        self.inner.throttle.record(source_name, retry_after, Instant::now());
    }

    /// Runs the three-phase acquisition algorithm described in §4.3: a
    /// throttle wait that holds no admission permit, a semaphore acquire
    /// that is the system-wide admission limit, and a vend that selects a
    /// concrete source and client.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledClient, PoolError> {
        let start = Instant::now();
        loop {
            self.wait_for_eligible_source(cancel, start).await?;

            let elapsed = start.elapsed();
            let remaining = self.inner.config.acquire_timeout.saturating_sub(elapsed);
            let permit = self.acquire_permit(remaining, cancel).await?;

            match self.select_and_vend(permit, start, cancel).await? {
                Some(client) => return Ok(client),
                None => continue, // every source went throttled again; restart at Phase 1
            }
        }
    }

    async fn wait_for_eligible_source(
        &self,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<(), PoolError> {
        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::cancelled());
            }
            let now = Instant::now();
            let any_eligible = self
                .inner
                .sources
                .iter()
                .any(|s| !self.inner.throttle.is_throttled(s.source.name(), now));
            if any_eligible {
                return Ok(());
            }

            let wait = self.inner.throttle.soonest_clear(now).unwrap_or(Duration::ZERO);
            if let Some(tolerance) = self.inner.config.max_retry_after_tolerance {
                if wait > tolerance {
                    return Err(PoolError::throttle_exceeds_tolerance());
                }
            }
            if start.elapsed() >= self.inner.config.acquire_timeout {
                return Err(PoolError::pool_exhausted());
            }

            let remaining_budget = self.inner.config.acquire_timeout.saturating_sub(start.elapsed());
            let sleep_for = wait.min(remaining_budget);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Err(PoolError::cancelled()),
            }
        }
    }

    async fn acquire_permit(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, PoolError> {
        let semaphore = self.inner.semaphore.clone();
        tokio::select! {
            res = semaphore.acquire_owned() => res.map_err(|_| PoolError::pool_exhausted()),
            _ = tokio::time::sleep(timeout) => Err(PoolError::pool_exhausted()),
            _ = cancel.cancelled() => Err(PoolError::cancelled()),
        }
    }

    /// Returns `Ok(Some(client))` on success, `Ok(None)` if every source
    /// became throttled again and the caller should restart at Phase 1.
    async fn select_and_vend(
        &self,
        permit: OwnedSemaphorePermit,
        start: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<PooledClient>, PoolError> {
        loop {
            if cancel.is_cancelled() {
                drop(permit);
                return Err(PoolError::cancelled());
            }
            let now = Instant::now();

            if let Some((idx, claim)) = self.claim_via_strategy(now) {
                let entry = &self.inner.sources[idx];
                let client = match claim {
                    Claim::Existing(client) => {
                        if client.validate().await {
                            client
                        } else {
                            // The slot claimed by `try_claim` is still ours;
                            // swap in a fresh connection without touching
                            // the in-use count.
                            match self.create_validated(entry).await {
                                Ok(client) => client,
                                Err(e) => {
                                    entry.abandon_claim();
                                    drop(permit);
                                    return Err(e);
                                }
                            }
                        }
                    }
                    Claim::NeedNew => match self.create_validated(entry).await {
                        Ok(client) => client,
                        Err(e) => {
                            entry.abandon_claim();
                            drop(permit);
                            return Err(e);
                        }
                    },
                    Claim::NoRoom | Claim::Throttled => unreachable!("filtered out by claim_via_strategy"),
                };

                return Ok(Some(PooledClient::new(
                    client,
                    entry.source.name().to_owned(),
                    permit,
                    Arc::downgrade(&self.inner),
                )));
            }

            if self.all_throttled(now) {
                drop(permit);
                return Ok(None);
            }
            if start.elapsed() >= self.inner.config.acquire_timeout {
                drop(permit);
                return Err(PoolError::pool_exhausted());
            }

            // Every source is non-throttled but momentarily at its own DOP
            // cap; wait for a release rather than spinning, bounded by the
            // overall acquire timeout.
            let remaining = self.inner.config.acquire_timeout.saturating_sub(start.elapsed());
            tokio::select! {
                _ = self.inner.freed.notified() => {}
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(50))) => {}
                _ = cancel.cancelled() => {
                    drop(permit);
                    return Err(PoolError::cancelled());
                }
            }
        }
    }

    async fn create_validated(&self, entry: &SourceEntry) -> Result<Box<dyn ServiceClient>, PoolError> {
        let first = entry.seed.box_clone();
        if first.validate().await {
            return Ok(first);
        }
        let second = entry.seed.box_clone();
        if second.validate().await {
            return Ok(second);
        }
        Err(PoolError::connection_failed(format!(
            "source {} produced an invalid connection twice",
            entry.source.name()
        )))
    }

    fn all_throttled(&self, now: Instant) -> bool {
        self.inner
            .sources
            .iter()
            .all(|s| self.inner.throttle.is_throttled(s.source.name(), now))
    }

    /// Applies the configured [`SelectionStrategy`] and returns the first
    /// source (in strategy order) that yields a claim, plus the claim itself.
    fn claim_via_strategy(&self, now: Instant) -> Option<(usize, Claim)> {
        let n = self.inner.sources.len();
        let start = self.inner.rr_cursor.fetch_add(1, Ordering::Relaxed) % n.max(1);
        let order: Vec<usize> = match self.inner.config.selection_strategy {
            SelectionStrategy::LeastInUse => {
                let mut indices: Vec<usize> = (0..n).collect();
                indices.sort_by_key(|&i| (self.inner.sources[i].in_use(), (i + n - start) % n));
                indices
            }
            SelectionStrategy::RoundRobin | SelectionStrategy::ThrottleAware => {
                (0..n).map(|offset| (start + offset) % n).collect()
            }
        };

        for idx in order {
            let entry = &self.inner.sources[idx];
            let throttled = self.inner.throttle.is_throttled(entry.source.name(), now);
            match entry.try_claim(throttled) {
                Claim::Throttled | Claim::NoRoom => continue,
                claim => return Some((idx, claim)),
            }
        }
        None
    }
}

impl PoolInner {
    fn release(&self, source_name: &str, client: Option<Box<dyn ServiceClient>>) {
        if let Some(entry) = self.sources.iter().find(|s| s.source.name() == source_name) {
            entry.release(client);
        }
        self.freed.notify_waiters();
    }
}

/// A checked-out client. Returns to its source's free list (and releases its
/// admission permit) when dropped, unless [`PooledClient::poison`] was
/// called first.
pub struct PooledClient {
    client: Option<Box<dyn ServiceClient>>,
    source_name: String,
    last_used: Instant,
    poisoned: bool,
    _permit: Option<OwnedSemaphorePermit>,
    pool: Weak<PoolInner>,
}

impl PooledClient {
    fn new(
        client: Box<dyn ServiceClient>,
        source_name: String,
        permit: OwnedSemaphorePermit,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            client: Some(client),
            source_name,
            last_used: Instant::now(),
            poisoned: false,
            _permit: Some(permit),
            pool,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Marks this client as unusable; it will be discarded instead of
    /// returned to the free list when dropped. Used by callers after an
    /// unrecoverable error on this specific connection.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl std::ops::Deref for PooledClient {
    type Target = dyn ServiceClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_deref().expect("pooled client used after release")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let client = self.client.take();
        if let Some(pool) = self.pool.upgrade() {
            let returned = if self.poisoned { None } else { client };
            pool.release(&self.source_name, returned);
        }
        // `_permit` drops here too, returning the admission slot.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockServiceClient;
    use crate::source::StaticTokenSource;
    use std::sync::atomic::AtomicU32;

    fn source(name: &str, max_dop: u32) -> Arc<dyn ConnectionSource> {
        Arc::new(StaticTokenSource::new(name, Box::new(MockServiceClient::new(name)), max_dop))
    }

    #[tokio::test]
    async fn total_parallelism_sums_source_dops() {
        let pool = ConnectionPool::new(vec![source("a", 4), source("b", 4)], PoolConfig::default());
        assert_eq!(pool.total_parallelism(), 8);
    }

    #[tokio::test]
    async fn acquire_vends_a_client_and_release_returns_it() {
        let pool = ConnectionPool::new(vec![source("a", 1)], PoolConfig::default());
        let cancel = CancellationToken::new();
        let client = pool.acquire(&cancel).await.expect("acquire");
        assert_eq!(client.source_name(), "a");
        drop(client);

        // With max_dop=1, a second acquire must succeed promptly because the
        // first was released.
        let second = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&cancel))
            .await
            .expect("should not time out")
            .expect("acquire");
        assert_eq!(second.source_name(), "a");
    }

    #[tokio::test]
    async fn per_source_cap_is_never_exceeded_under_concurrency() {
        let pool = ConnectionPool::new(vec![source("a", 2), source("b", 2)], PoolConfig::default());
        let cancel = CancellationToken::new();
        let max_seen: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
        let in_flight = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let max_seen = max_seen.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let client = pool.acquire(&cancel).await.expect("acquire");
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(client);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn throttled_source_is_skipped_in_favor_of_another() {
        let pool = ConnectionPool::new(vec![source("a", 4), source("b", 4)], PoolConfig::default());
        pool.record_throttle("a", Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let client = tokio::time::timeout(Duration::from_millis(200), pool.acquire(&cancel))
            .await
            .expect("must not block behind the throttled source")
            .expect("acquire");
        assert_eq!(client.source_name(), "b");
    }

    #[tokio::test]
    async fn least_in_use_ties_are_broken_by_rotation() {
        let pool = ConnectionPool::new(
            vec![source("a", 4), source("b", 4), source("c", 4)],
            PoolConfig {
                selection_strategy: SelectionStrategy::LeastInUse,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let client = pool.acquire(&cancel).await.expect("acquire");
            seen.push(client.source_name().to_owned());
            drop(client);
        }

        let unique: std::collections::HashSet<_> = seen.iter().cloned().collect();
        assert_eq!(unique.len(), 3, "all-tied sources should rotate rather than always picking the same one: {seen:?}");
    }

    #[tokio::test]
    async fn all_sources_throttled_beyond_tolerance_fails_fast() {
        let pool = ConnectionPool::new(
            vec![source("a", 4)],
            PoolConfig {
                max_retry_after_tolerance: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        );
        pool.record_throttle("a", Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::PoolErrorKind::ThrottleExceedsTolerance));
    }

    #[tokio::test]
    async fn cancellation_before_vend_surfaces_cancelled_and_releases_permit() {
        let pool = ConnectionPool::new(vec![source("a", 1)], PoolConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(pool.inner.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn poisoned_client_is_not_returned_to_the_free_list() {
        let pool = ConnectionPool::new(vec![source("a", 1)], PoolConfig::default());
        let cancel = CancellationToken::new();
        let mut client = pool.acquire(&cancel).await.expect("acquire");
        client.poison();
        drop(client);

        assert_eq!(pool.inner.sources[0].state.lock().unwrap().free.len(), 0);
    }
}
