//! The typed result sink consumed by every processor.

use std::sync::Arc;

use async_trait::async_trait;
use mxprobe_dns::{DnsJob, DnsJobGroup};
use mxprobe_pool::{PoolStatus, Work, WorkerPool};
use mxprobe_probe::{HostSummary, TxtRecord};
use thiserror::Error;
use tracing::{debug, error, info};

/// Everything the pipeline can hand to the sink.
///
/// A closed set on purpose: the dispatcher is a match, and an unknown payload
/// kind is a compile error rather than a runtime surprise.
#[derive(Debug)]
pub enum Finding {
    /// A completed MX lookup for a domain.
    Dns(Arc<DnsJob>),
    /// A completed A/AAAA group for an MX hostname.
    DnsGroup(DnsJobGroup),
    /// One probed host.
    Host(HostSummary),
    /// The aggregated record of an MX hostname.
    MxRecord { hostname: String, record: TxtRecord },
    /// DER certificates observed during a probe, leaf first.
    Certificates(Vec<Vec<u8>>),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Two workers raced on the same row; the first write won.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("store failure: {0}")]
    Failed(String),
}

impl StoreError {
    /// Benign errors are logged and dropped; everything else is fatal.
    #[must_use]
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

/// The persistence seam behind the sink.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn store(&self, finding: &Finding) -> Result<(), StoreError>;

    /// MX hostnames already known to the store, for re-feeding the pipeline.
    async fn mx_hostnames(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

/// A store that records findings to the log and keeps nothing.
#[derive(Debug, Default)]
pub struct LogStore;

#[async_trait]
impl ResultStore for LogStore {
    async fn store(&self, finding: &Finding) -> Result<(), StoreError> {
        match finding {
            Finding::Dns(job) => {
                info!(query = %job.query(), answer = ?job.try_answer(), "domain resolved");
            }
            Finding::DnsGroup(group) => {
                for job in group.jobs() {
                    info!(query = %job.query(), answer = ?job.try_answer(), "mx addresses resolved");
                }
            }
            Finding::Host(summary) => {
                info!(
                    address = %summary.address,
                    starttls = ?summary.starttls,
                    error = ?summary.error,
                    "host probed"
                );
            }
            Finding::MxRecord { hostname, record } => {
                info!(%hostname, txt = %record, "mx record aggregated");
            }
            Finding::Certificates(certificates) => {
                debug!(count = certificates.len(), "certificates observed");
            }
        }
        Ok(())
    }
}

/// Pool work: route one finding into the store.
struct StoreWork {
    store: Arc<dyn ResultStore>,
}

#[async_trait]
impl Work<Finding> for StoreWork {
    async fn run(&self, finding: Finding) {
        if let Err(store_error) = self.store.store(&finding).await {
            if store_error.is_benign() {
                debug!("ignoring benign store conflict: {store_error}");
            } else {
                // Losing results silently would defeat the scan; stop hard.
                error!("result store failed: {store_error}");
                std::process::exit(1);
            }
        }
    }
}

/// Worker-pool-backed dispatcher in front of a [`ResultStore`].
pub struct ResultProcessor {
    pool: WorkerPool<Finding>,
    store: Arc<dyn ResultStore>,
}

impl std::fmt::Debug for ResultProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultProcessor")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ResultProcessor {
    #[must_use]
    pub fn new(max_workers: u32, store: Arc<dyn ResultStore>) -> Self {
        let pool = WorkerPool::new(
            max_workers,
            Arc::new(StoreWork {
                store: Arc::clone(&store),
            }) as Arc<dyn Work<Finding>>,
        );
        Self { pool, store }
    }

    /// Enqueues a finding; suspends only on queue backpressure.
    pub async fn add(&self, finding: Finding) {
        self.pool.add(finding).await;
    }

    /// Closes the pool, draining queued findings first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct CountingStore {
        stored: AtomicU64,
    }

    #[async_trait]
    impl ResultStore for CountingStore {
        async fn store(&self, _finding: &Finding) -> Result<(), StoreError> {
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_drains_queued_findings() {
        let store = Arc::new(CountingStore {
            stored: AtomicU64::new(0),
        });
        let processor = ResultProcessor::new(1, Arc::clone(&store) as Arc<dyn ResultStore>);

        for _ in 0..5 {
            processor
                .add(Finding::Certificates(vec![b"der".to_vec()]))
                .await;
        }
        processor.close().await;

        assert_eq!(store.stored.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn benign_conflicts_are_swallowed() {
        struct ConflictingStore;

        #[async_trait]
        impl ResultStore for ConflictingStore {
            async fn store(&self, _finding: &Finding) -> Result<(), StoreError> {
                Err(StoreError::DuplicateKey("mx_hosts: 192.0.2.1".to_string()))
            }
        }

        let processor = ResultProcessor::new(1, Arc::new(ConflictingStore));
        processor
            .add(Finding::Certificates(vec![b"der".to_vec()]))
            .await;
        // Draining without the process dying is the assertion.
        processor.close().await;
        assert_eq!(processor.status().processed, 1);
    }
}
