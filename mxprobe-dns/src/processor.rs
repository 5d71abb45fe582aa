use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use hickory_resolver::proto::rr::RecordType;
use mxprobe_pool::{PoolStatus, Work, WorkerPool};
use tracing::trace;

use crate::{
    answer::DnsQuery,
    job::{DnsJob, DnsJobGroup},
    resolver::Resolve,
};

struct InFlight {
    jobs: parking_lot::Mutex<AHashMap<DnsQuery, Arc<DnsJob>>>,
}

/// Pool work: resolve, store, then drop the dedup slot and release waiters.
struct ResolveWork {
    resolver: Arc<dyn Resolve>,
    in_flight: Arc<InFlight>,
}

#[async_trait]
impl Work<Arc<DnsJob>> for ResolveWork {
    async fn run(&self, job: Arc<DnsJob>) {
        let answer = self.resolver.resolve(job.query()).await;
        job.store(answer);

        self.in_flight.jobs.lock().remove(job.query());

        trace!(query = %job.query(), "query finished");
        job.release();
    }
}

/// Coalesces concurrent identical queries onto a single [`Resolve`] call.
pub struct DnsProcessor {
    in_flight: Arc<InFlight>,
    pool: WorkerPool<Arc<DnsJob>>,
}

impl std::fmt::Debug for DnsProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsProcessor")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl DnsProcessor {
    #[must_use]
    pub fn new(max_workers: u32, resolver: Arc<dyn Resolve>) -> Self {
        let in_flight = Arc::new(InFlight {
            jobs: parking_lot::Mutex::new(AHashMap::new()),
        });

        let pool = WorkerPool::new(
            max_workers,
            Arc::new(ResolveWork {
                resolver,
                in_flight: Arc::clone(&in_flight),
            }) as Arc<dyn Work<Arc<DnsJob>>>,
        );

        Self { in_flight, pool }
    }

    /// Returns the job for `(domain, rrtype)`, joining an in-flight identical
    /// query when one exists.
    pub async fn new_job(&self, domain: &str, rrtype: RecordType) -> Arc<DnsJob> {
        let query = DnsQuery::new(domain, rrtype);

        let (job, created) = {
            let mut jobs = self.in_flight.jobs.lock();
            if let Some(job) = jobs.get(&query) {
                (Arc::clone(job), false)
            } else {
                let job = Arc::new(DnsJob::new(query.clone()));
                jobs.insert(query, Arc::clone(&job));
                (job, true)
            }
        };

        if created {
            trace!(query = %job.query(), "query created");
            self.pool.add(Arc::clone(&job)).await;
        }

        job
    }

    /// Issues one job per record type for `domain`.
    pub async fn new_jobs(&self, domain: &str, rrtypes: &[RecordType]) -> DnsJobGroup {
        let mut group = DnsJobGroup::default();
        for rrtype in rrtypes {
            group.push(self.new_job(domain, *rrtype).await);
        }
        group
    }

    /// Closes the pool; queued queries are drained first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Number of distinct queries currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.jobs.lock().len()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    use crate::answer::DnsAnswer;

    use super::*;

    /// Counts invocations and answers slowly enough for callers to pile up.
    struct CountingResolver {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn resolve(&self, query: &DnsQuery) -> DnsAnswer {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            DnsAnswer {
                records: vec![format!("answer for {}", query.domain)],
                ..DnsAnswer::default()
            }
        }
    }

    #[tokio::test]
    async fn identical_concurrent_queries_share_one_resolve_call() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU64::new(0),
        });
        let processor = Arc::new(DnsProcessor::new(1, Arc::clone(&resolver) as Arc<dyn Resolve>));

        let first = processor.new_job("example.test", RecordType::A).await;
        let second = processor.new_job("example.test", RecordType::A).await;
        assert!(Arc::ptr_eq(&first, &second));

        let (left, right) = tokio::join!(first.results(), second.results());
        assert_eq!(left, right);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        processor.close().await;
    }

    #[tokio::test]
    async fn distinct_queries_resolve_separately() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU64::new(0),
        });
        let processor = DnsProcessor::new(2, Arc::clone(&resolver) as Arc<dyn Resolve>);

        let a = processor.new_job("example.test", RecordType::A).await;
        let aaaa = processor.new_job("example.test", RecordType::AAAA).await;
        assert!(!Arc::ptr_eq(&a, &aaaa));

        a.wait().await;
        aaaa.wait().await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);

        processor.close().await;
    }

    #[tokio::test]
    async fn completed_jobs_leave_the_dedup_map() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU64::new(0),
        });
        let processor = DnsProcessor::new(1, Arc::clone(&resolver) as Arc<dyn Resolve>);

        let job = processor.new_job("example.test", RecordType::MX).await;
        job.wait().await;
        assert_eq!(processor.in_flight(), 0);

        // The held job is still readable after the map forgot it.
        assert!(job.try_answer().is_some());

        let again = processor.new_job("example.test", RecordType::MX).await;
        assert!(!Arc::ptr_eq(&job, &again));

        processor.close().await;
    }

    #[tokio::test]
    async fn groups_flatten_results_in_order() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU64::new(0),
        });
        let processor = DnsProcessor::new(2, Arc::clone(&resolver) as Arc<dyn Resolve>);

        let group = processor
            .new_jobs("example.test", &[RecordType::A, RecordType::AAAA])
            .await;
        assert_eq!(group.len(), 2);

        let results = group.results().await;
        assert_eq!(results.len(), 2);

        processor.close().await;
    }
}
