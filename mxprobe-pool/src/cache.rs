//! Keyed entry cache wrapped around a [`WorkerPool`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    error::ConfigError,
    latch::Latch,
    pool::{Work, WorkerPool},
};

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}

fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Expiry and refresh policy for a [`CachedWorkerPool`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    expire_after: Duration,
    refresh_after: Duration,
    check_interval: Duration,
}

impl CacheConfig {
    /// `refresh_after = 0` means entries are never refreshed, only expired.
    pub const fn new(
        expire_after: Duration,
        refresh_after: Duration,
        check_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if expire_after.is_zero() {
            return Err(ConfigError::ZeroExpiry);
        }
        if check_interval.is_zero() {
            return Err(ConfigError::ZeroCheckInterval);
        }
        Ok(Self {
            expire_after,
            refresh_after,
            check_interval,
        })
    }

    #[must_use]
    pub const fn expire_after(&self) -> Duration {
        self.expire_after
    }

    #[must_use]
    pub const fn refresh_after(&self) -> Duration {
        self.refresh_after
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn should_expire(&self, accessed: SystemTime, now: SystemTime) -> bool {
        now.duration_since(accessed)
            .is_ok_and(|idle| idle > self.expire_after)
    }

    // Deliberately true for entries that completed just before the sweep
    // whenever refresh_after < check_interval; operators own that trade-off.
    fn should_refresh(&self, refreshed: SystemTime, now: SystemTime) -> bool {
        !self.refresh_after.is_zero()
            && now
                .duration_since(refreshed)
                .is_ok_and(|age| age > self.refresh_after)
    }
}

/// Config counters as serialised into the status report.
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfigStatus {
    pub expire_after_secs: u64,
    pub refresh_after_secs: u64,
    pub check_interval_secs: u64,
}

impl From<&CacheConfig> for CacheConfigStatus {
    fn from(config: &CacheConfig) -> Self {
        Self {
            expire_after_secs: config.expire_after.as_secs(),
            refresh_after_secs: config.refresh_after.as_secs(),
            check_interval_secs: config.check_interval.as_secs(),
        }
    }
}

/// One cached computation, shared between the cache map and every caller
/// that requested it.
///
/// `value` is written by the work function and must only be read after the
/// latch has been observed open ([`wait`](Self::wait)). `hits` and
/// `accessed` are updated outside the cache lock under an intentional data
/// race; they are statistical counters.
pub struct CacheEntry<V> {
    key: Box<[u8]>,
    value: parking_lot::RwLock<Option<V>>,
    pending: AtomicBool,
    hits: AtomicU64,
    created: SystemTime,
    accessed: AtomicU64,
    refreshed: AtomicU64,
    latch: Latch,
}

impl<V> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("pending", &self.pending.load(Ordering::Acquire))
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V: Clone> CacheEntry<V> {
    fn new(key: &[u8], created: SystemTime) -> Self {
        Self {
            key: key.into(),
            value: parking_lot::RwLock::new(None),
            pending: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            created,
            accessed: AtomicU64::new(unix_millis(created)),
            refreshed: AtomicU64::new(0),
            latch: Latch::new(1),
        }
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The stored value, `None` until the first completion.
    #[must_use]
    pub fn value(&self) -> Option<V> {
        self.value.read().clone()
    }

    /// Stores the computation result. Called by work functions only.
    pub fn set_value(&self, value: V) {
        *self.value.write() = Some(value);
    }

    /// Whether the entry is enqueued or executing.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn created(&self) -> SystemTime {
        self.created
    }

    #[must_use]
    pub fn accessed(&self) -> SystemTime {
        from_unix_millis(self.accessed.load(Ordering::Relaxed))
    }

    /// Completion time of the most recent work run, `None` before the first.
    #[must_use]
    pub fn refreshed(&self) -> Option<SystemTime> {
        match self.refreshed.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(from_unix_millis(millis)),
        }
    }

    /// Waits until the in-flight computation (if any) completes.
    pub async fn wait(&self) {
        self.latch.wait().await;
    }

    fn touch(&self, at: SystemTime) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.accessed.fetch_max(unix_millis(at), Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheEntrySnapshot<V> {
        CacheEntrySnapshot {
            value: self.value(),
            pending: self.pending(),
            hits: self.hits(),
            created: unix_millis(self.created) / 1000,
            accessed: self.accessed.load(Ordering::Relaxed) / 1000,
            refreshed: self.refreshed.load(Ordering::Relaxed) / 1000,
        }
    }
}

/// Serialisable view of a [`CacheEntry`], used by the cache dump commands.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySnapshot<V> {
    pub value: Option<V>,
    pub pending: bool,
    pub hits: u64,
    /// Unix seconds.
    pub created: u64,
    /// Unix seconds.
    pub accessed: u64,
    /// Unix seconds; 0 until the first completion.
    pub refreshed: u64,
}

/// Cache counters as serialised into the status report.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub expiries: u64,
    pub config: Option<CacheConfigStatus>,
}

struct Shared<V> {
    entries: parking_lot::Mutex<AHashMap<Box<[u8]>, Arc<CacheEntry<V>>>>,
    config: Option<CacheConfig>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    expiries: AtomicU64,
}

/// The pool-side wrapper around the user work: runs it, then publishes the
/// completion (uncached entries are dropped from the map first).
struct CacheWork<V> {
    work: Arc<dyn Work<Arc<CacheEntry<V>>>>,
    shared: Arc<Shared<V>>,
}

#[async_trait]
impl<V> Work<Arc<CacheEntry<V>>> for CacheWork<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn run(&self, entry: Arc<CacheEntry<V>>) {
        self.work.run(Arc::clone(&entry)).await;

        if self.shared.config.is_none() {
            self.shared.entries.lock().remove(entry.key());
        }

        // Publish, then release: the value is in place before any waiter
        // observes the open latch.
        entry
            .refreshed
            .store(unix_millis(SystemTime::now()), Ordering::Relaxed);
        entry.pending.store(false, Ordering::Release);
        entry.latch.done();
    }
}

/// A [`WorkerPool`] with a keyed entry cache.
///
/// Guarantees: at most one in-flight computation per key; a second arrival
/// during computation receives the same entry and the same latch; completed
/// values are observable to every released waiter; refreshes keep the entry
/// identity stable; expiry only removes quiescent entries.
pub struct CachedWorkerPool<V> {
    shared: Arc<Shared<V>>,
    pool: Arc<WorkerPool<Arc<CacheEntry<V>>>>,
    sweeper: parking_lot::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<V> std::fmt::Debug for CachedWorkerPool<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedWorkerPool")
            .field("entries", &self.shared.entries.lock().len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<V> CachedWorkerPool<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cached pool.
    ///
    /// Without a `config` the pool runs uncached: each entry is removed from
    /// the map when its work completes, so a later `new_job` on the same key
    /// starts a fresh computation. With a `config` a sweeper task expires and
    /// refreshes entries every `check_interval`.
    #[must_use]
    pub fn new(
        max_workers: u32,
        work: Arc<dyn Work<Arc<CacheEntry<V>>>>,
        config: Option<CacheConfig>,
    ) -> Self {
        let shared = Arc::new(Shared {
            entries: parking_lot::Mutex::new(AHashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            expiries: AtomicU64::new(0),
        });

        let pool = Arc::new(WorkerPool::new(
            max_workers,
            Arc::new(CacheWork {
                work,
                shared: Arc::clone(&shared),
            }) as Arc<dyn Work<Arc<CacheEntry<V>>>>,
        ));

        let sweeper = config.map(|config| {
            let (stop, stopped) = watch::channel(false);
            let handle = tokio::spawn(sweep_loop(
                Arc::clone(&shared),
                Arc::clone(&pool),
                config,
                stopped,
            ));
            (stop, handle)
        });

        Self {
            shared,
            pool,
            sweeper: parking_lot::Mutex::new(sweeper),
        }
    }

    /// Returns the entry for `key`, creating and enqueueing it on a miss.
    ///
    /// `accessed` is the caller's access time; it is folded into the entry
    /// with `max`, so an upstream stage can propagate its own recency into a
    /// downstream cache. Callers that need the value must [`CacheEntry::wait`]
    /// first.
    pub async fn new_job(&self, key: &[u8], accessed: SystemTime) -> Arc<CacheEntry<V>> {
        let (entry, created) = {
            let mut entries = self.shared.entries.lock();
            if let Some(entry) = entries.get(key) {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                (Arc::clone(entry), false)
            } else {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(CacheEntry::new(key, accessed));
                entries.insert(entry.key.clone(), Arc::clone(&entry));
                (entry, true)
            }
        };

        // Outside the critical section; the race is tolerated, the counters
        // are statistical.
        entry.touch(accessed);

        if created {
            self.pool.add(Arc::clone(&entry)).await;
        }

        entry
    }

    /// Stops the sweeper, then closes the pool and drains it.
    pub async fn close(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some((stop, handle)) = sweeper {
            let _ = stop.send(true);
            let _ = handle.await;
        }
        self.pool.close().await;
    }

    #[must_use]
    pub fn entries(&self) -> usize {
        self.shared.entries.lock().len()
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool<Arc<CacheEntry<V>>> {
        &self.pool
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.shared.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.shared.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn refreshes(&self) -> u64 {
        self.shared.refreshes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn expiries(&self) -> u64 {
        self.shared.expiries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_status(&self) -> CacheStatus {
        CacheStatus {
            entries: self.entries(),
            hits: self.hits(),
            misses: self.misses(),
            refreshes: self.refreshes(),
            expiries: self.expiries(),
            config: self.shared.config.as_ref().map(CacheConfigStatus::from),
        }
    }

    /// Snapshot of every entry, for the cache dump commands.
    #[must_use]
    pub fn dump(&self) -> Vec<(Vec<u8>, CacheEntrySnapshot<V>)> {
        self.shared
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.to_vec(), entry.snapshot()))
            .collect()
    }
}

/// One sweep pass: expire idle entries, collect completed-but-stale entries
/// for re-enqueue. Runs under the cache lock; enqueueing happens outside it
/// because the pool queue may be full.
fn sweep<V: Clone>(shared: &Shared<V>, config: &CacheConfig) -> Vec<Arc<CacheEntry<V>>> {
    let now = SystemTime::now();
    let mut due = Vec::new();

    shared.entries.lock().retain(|_, entry| {
        if entry.pending() {
            return true;
        }
        if config.should_expire(entry.accessed(), now) {
            shared.expiries.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if entry
            .refreshed()
            .is_some_and(|refreshed| config.should_refresh(refreshed, now))
        {
            entry.pending.store(true, Ordering::Release);
            entry.latch.add(1);
            due.push(Arc::clone(entry));
        }
        true
    });

    due
}

async fn sweep_loop<V>(
    shared: Arc<Shared<V>>,
    pool: Arc<WorkerPool<Arc<CacheEntry<V>>>>,
    config: CacheConfig,
    mut stopped: watch::Receiver<bool>,
) where
    V: Clone + Send + Sync + 'static,
{
    loop {
        let due = sweep(&shared, &config);
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "re-enqueueing stale cache entries");
        }
        shared
            .refreshes
            .fetch_add(due.len() as u64, Ordering::Relaxed);

        for entry in due {
            pool.add(entry).await;
        }

        tokio::select! {
            () = tokio::time::sleep(config.check_interval) => {}
            _ = stopped.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Stamp;

    #[async_trait]
    impl Work<Arc<CacheEntry<u64>>> for Stamp {
        async fn run(&self, entry: Arc<CacheEntry<u64>>) {
            let previous = entry.value().unwrap_or(0);
            entry.set_value(previous + 1);
        }
    }

    fn config(expire: Duration, refresh: Duration, check: Duration) -> CacheConfig {
        CacheConfig::new(expire, refresh, check).unwrap()
    }

    #[tokio::test]
    async fn concurrent_jobs_share_one_entry() {
        let pool = CachedWorkerPool::new(0, Arc::new(Stamp), None);

        let first = pool.new_job(b"127.0.0.1", SystemTime::now()).await;
        let second = pool.new_job(b"127.0.0.1", SystemTime::now()).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.misses(), 1);
        assert_eq!(pool.hits(), 1);
        assert_eq!(pool.pool().pending(), 1);
    }

    #[tokio::test]
    async fn completed_entry_is_a_cache_hit() {
        let pool = CachedWorkerPool::new(
            1,
            Arc::new(Stamp),
            Some(config(
                Duration::from_secs(3600),
                Duration::ZERO,
                Duration::from_secs(3600),
            )),
        );

        let entry = pool.new_job(b"127.0.0.1", SystemTime::now()).await;
        entry.wait().await;
        assert_eq!(pool.misses(), 1);
        assert_eq!(entry.value(), Some(1));

        let again = pool.new_job(b"127.0.0.1", SystemTime::now()).await;
        assert_eq!(pool.hits(), 1);
        assert_eq!(pool.misses(), 1);
        assert!(Arc::ptr_eq(&entry, &again));

        pool.close().await;
    }

    #[tokio::test]
    async fn uncached_pool_forgets_completed_entries() {
        let pool = CachedWorkerPool::new(1, Arc::new(Stamp), None);

        let entry = pool.new_job(b"key", SystemTime::now()).await;
        entry.wait().await;
        assert_eq!(pool.entries(), 0);

        let fresh = pool.new_job(b"key", SystemTime::now()).await;
        assert!(!Arc::ptr_eq(&entry, &fresh));
        assert_eq!(pool.misses(), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn waiters_observe_the_stored_value() {
        let pool = Arc::new(CachedWorkerPool::new(1, Arc::new(Stamp), None));

        let entry = pool.new_job(b"key", SystemTime::now()).await;
        let waiters = (0..4)
            .map(|_| {
                let entry = Arc::clone(&entry);
                tokio::spawn(async move {
                    entry.wait().await;
                    entry.value()
                })
            })
            .collect::<Vec<_>>();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Some(1));
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn refresh_advances_refreshed_and_keeps_the_key() {
        let pool = CachedWorkerPool::new(
            1,
            Arc::new(Stamp),
            Some(config(
                Duration::from_secs(3600),
                Duration::from_millis(50),
                Duration::from_millis(20),
            )),
        );

        let entry = pool.new_job(b"key", SystemTime::now()).await;
        entry.wait().await;
        let first_completion = entry.refreshed().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(pool.refreshes() >= 1);
        assert_eq!(pool.entries(), 1);
        entry.wait().await;
        assert!(entry.refreshed().unwrap() > first_completion);
        assert!(entry.value().unwrap_or(0) >= 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn idle_entries_expire_while_pending_ones_survive() {
        let pool = CachedWorkerPool::new(
            1,
            Arc::new(Stamp),
            Some(config(
                Duration::from_millis(50),
                Duration::ZERO,
                Duration::from_millis(20),
            )),
        );

        let entry = pool.new_job(b"key", SystemTime::now()).await;
        entry.wait().await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pool.entries(), 0);
        assert!(pool.expiries() >= 1);

        // The held handle stays valid; the cache has merely unreferenced it.
        assert_eq!(entry.value(), Some(1));

        pool.close().await;
    }

    #[tokio::test]
    async fn access_time_folds_with_max() {
        let pool = CachedWorkerPool::new(0, Arc::new(Stamp), None);

        let early = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let late = early + Duration::from_secs(60);

        let entry = pool.new_job(b"key", late).await;
        pool.new_job(b"key", early).await;

        assert_eq!(entry.accessed(), late);
        assert_eq!(entry.hits(), 2);
    }

    #[test]
    fn zero_expiry_is_rejected() {
        assert!(matches!(
            CacheConfig::new(Duration::ZERO, Duration::ZERO, Duration::from_secs(1)),
            Err(ConfigError::ZeroExpiry)
        ));
        assert!(matches!(
            CacheConfig::new(Duration::from_secs(1), Duration::ZERO, Duration::ZERO),
            Err(ConfigError::ZeroCheckInterval)
        ));
    }
}
