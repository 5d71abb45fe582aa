//! Elastic worker pool over a bounded queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};

/// Queue depth of every pool.
///
/// This is a property of the system, not a tunable: it bounds memory and is
/// the backpressure point between pipeline stages.
pub const QUEUE_DEPTH: usize = 100;

/// The work a pool executes on each dequeued item.
///
/// Implementations must not panic: a panic takes the whole process down.
/// Failures are signalled inside the item payload instead.
#[async_trait]
pub trait Work<T>: Send + Sync + 'static {
    async fn run(&self, item: T);
}

/// Rolling per-second throughput histogram covering the last minute.
#[derive(Debug)]
struct Throughput {
    slots: [AtomicU32; 60],
    position: AtomicUsize,
}

impl Throughput {
    fn new() -> Self {
        Self {
            slots: [const { AtomicU32::new(0) }; 60],
            position: AtomicUsize::new(0),
        }
    }

    fn record(&self) {
        self.slots[self.position.load(Ordering::Relaxed)].fetch_add(1, Ordering::Relaxed);
    }

    fn advance(&self) {
        let next = (self.position.load(Ordering::Relaxed) + 1) % self.slots.len();
        self.slots[next].store(0, Ordering::Relaxed);
        self.position.store(next, Ordering::Relaxed);
    }

    fn per_minute(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| u64::from(slot.load(Ordering::Relaxed)))
            .sum()
    }
}

/// Point-in-time pool counters, as exposed by the status reporter.
///
/// Reads are unsynchronised; every counter is monotonic or a gauge, so a
/// snapshot is consistent enough for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pending: usize,
    pub processed: u64,
    pub processing: u64,
    pub workers_current: u32,
    pub workers_max: u32,
    pub jobs_per_minute: u64,
}

/// A pool of workers executing one [`Work`] function on queued items.
///
/// The pool is elastic upward only: [`add`](Self::add) spawns an additional
/// worker whenever the queue would otherwise sit idle, up to `max_workers`,
/// and workers never exit until [`close`](Self::close). A burst therefore
/// raises the steady-state worker count; that is accepted.
pub struct WorkerPool<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
    work: Arc<dyn Work<T>>,
    processed: Arc<AtomicU64>,
    processing: Arc<AtomicU64>,
    throughput: Arc<Throughput>,
    workers_current: Arc<AtomicU32>,
    workers_max: u32,
    workers: parking_lot::Mutex<JoinSet<()>>,
    ticker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pending", &self.sender.len())
            .field(
                "workers_current",
                &self.workers_current.load(Ordering::Relaxed),
            )
            .field("workers_max", &self.workers_max)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool capped at `max_workers` parallel executors.
    ///
    /// `max_workers = 0` builds a pool on which no worker ever runs; items
    /// queue up until [`close`](Self::close). Must be called from within a
    /// tokio runtime (the stats ticker is spawned here).
    #[must_use]
    pub fn new(max_workers: u32, work: Arc<dyn Work<T>>) -> Self {
        let (sender, receiver) = async_channel::bounded(QUEUE_DEPTH);
        let throughput = Arc::new(Throughput::new());

        let ticker = tokio::spawn({
            let throughput = Arc::clone(&throughput);
            async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    throughput.advance();
                }
            }
        });

        Self {
            sender,
            receiver,
            work,
            processed: Arc::new(AtomicU64::new(0)),
            processing: Arc::new(AtomicU64::new(0)),
            throughput,
            workers_current: Arc::new(AtomicU32::new(0)),
            workers_max: max_workers,
            workers: parking_lot::Mutex::new(JoinSet::new()),
            ticker: parking_lot::Mutex::new(Some(ticker)),
        }
    }

    /// Enqueues an item, growing the pool first when it would otherwise sit
    /// idle.
    ///
    /// Suspends while the queue is full; that backpressure is the pipeline's
    /// throttle.
    ///
    /// # Panics
    ///
    /// Panics when called after [`close`](Self::close); the pipeline closes
    /// stages from the producing end, so an add on a closed pool is a wiring
    /// bug.
    pub async fn add(&self, item: T) {
        self.maybe_spawn();
        self.sender
            .send(item)
            .await
            .expect("add on a closed worker pool");
    }

    /// Spawns one additional worker iff no worker exists yet, or the queue is
    /// non-empty and the cap allows it.
    fn maybe_spawn(&self) {
        loop {
            let current = self.workers_current.load(Ordering::Acquire);
            if current >= self.workers_max {
                return;
            }
            if current != 0 && self.receiver.is_empty() {
                return;
            }
            if self
                .workers_current
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    fn spawn_worker(&self) {
        let receiver = self.receiver.clone();
        let work = Arc::clone(&self.work);
        let processed = Arc::clone(&self.processed);
        let processing = Arc::clone(&self.processing);
        let throughput = Arc::clone(&self.throughput);

        self.workers.lock().spawn(async move {
            while let Ok(item) = receiver.recv().await {
                processing.fetch_add(1, Ordering::Relaxed);
                work.run(item).await;
                processing.fetch_sub(1, Ordering::Relaxed);
                processed.fetch_add(1, Ordering::Relaxed);
                throughput.record();
            }
        });
    }

    /// Closes the queue, drains the remaining items, and returns once every
    /// worker is gone and the stats ticker is stopped.
    pub async fn close(&self) {
        self.sender.close();

        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.abort();
            let _ = ticker.await;
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        while workers.join_next().await.is_some() {}
    }

    /// Number of items waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Number of completed work invocations since start.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Number of items currently inside the work function.
    #[must_use]
    pub fn processing(&self) -> u64 {
        self.processing.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn workers_current(&self) -> u32 {
        self.workers_current.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn workers_max(&self) -> u32 {
        self.workers_max
    }

    /// Completions over the last 60 seconds.
    #[must_use]
    pub fn jobs_per_minute(&self) -> u64 {
        self.throughput.per_minute()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pending: self.pending(),
            processed: self.processed(),
            processing: self.processing(),
            workers_current: self.workers_current(),
            workers_max: self.workers_max,
            jobs_per_minute: self.jobs_per_minute(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct Count {
        ran: AtomicU64,
    }

    #[async_trait]
    impl Work<u64> for Count {
        async fn run(&self, item: u64) {
            self.ran.fetch_add(item, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn zero_workers_never_run() {
        let work = Arc::new(Count {
            ran: AtomicU64::new(0),
        });
        let pool = WorkerPool::new(0, Arc::clone(&work) as Arc<dyn Work<u64>>);

        pool.add(1).await;
        pool.add(2).await;

        assert_eq!(pool.pending(), 2);
        assert_eq!(pool.workers_current(), 0);
        assert_eq!(work.ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_drains_remaining_items() {
        let work = Arc::new(Count {
            ran: AtomicU64::new(0),
        });
        let pool = WorkerPool::new(1, Arc::clone(&work) as Arc<dyn Work<u64>>);

        for _ in 0..10 {
            pool.add(1).await;
        }
        pool.close().await;

        assert_eq!(work.ran.load(Ordering::SeqCst), 10);
        assert_eq!(pool.processed(), 10);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn workers_grow_up_to_the_cap() {
        struct Slow;

        #[async_trait]
        impl Work<u64> for Slow {
            async fn run(&self, _item: u64) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let pool = WorkerPool::new(4, Arc::new(Slow));
        for item in 0..8 {
            pool.add(item).await;
        }

        let grown = pool.workers_current();
        assert!(grown >= 1 && grown <= 4, "unexpected worker count {grown}");

        pool.close().await;
        assert_eq!(pool.processed(), 8);
    }

    #[tokio::test]
    async fn processed_is_monotone() {
        let work = Arc::new(Count {
            ran: AtomicU64::new(0),
        });
        let pool = WorkerPool::new(2, Arc::clone(&work) as Arc<dyn Work<u64>>);

        let mut last = 0;
        for _ in 0..5 {
            pool.add(1).await;
            let processed = pool.processed();
            assert!(processed >= last);
            last = processed;
        }

        pool.close().await;
        assert_eq!(pool.processed(), 5);
    }
}
