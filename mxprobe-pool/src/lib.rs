//! Worker pools with deduplicating entry caches.
//!
//! [`WorkerPool`] executes a fixed [`Work`] function on queued items behind a
//! bounded queue; [`CachedWorkerPool`] adds a keyed entry cache with waiter
//! coalescing, periodic refresh, and expiry. These two primitives carry the
//! whole probing pipeline.

pub mod cache;
pub mod error;
pub mod latch;
pub mod pool;

pub use cache::{CacheConfig, CacheEntry, CacheStatus, CachedWorkerPool};
pub use error::ConfigError;
pub use latch::Latch;
pub use pool::{PoolStatus, QUEUE_DEPTH, Work, WorkerPool};
