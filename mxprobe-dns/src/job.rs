use std::sync::OnceLock;

use mxprobe_pool::Latch;

use crate::answer::{DnsAnswer, DnsQuery};

/// One in-flight query, shared between the dedup map and every caller.
///
/// The job lives as long as any caller holds it; the processor drops its map
/// slot as soon as the result is stored, so later identical queries start
/// fresh.
#[derive(Debug)]
pub struct DnsJob {
    query: DnsQuery,
    result: OnceLock<DnsAnswer>,
    latch: Latch,
}

impl DnsJob {
    pub(crate) fn new(query: DnsQuery) -> Self {
        Self {
            query,
            result: OnceLock::new(),
            latch: Latch::new(1),
        }
    }

    #[must_use]
    pub const fn query(&self) -> &DnsQuery {
        &self.query
    }

    /// Waits until the query has finished.
    pub async fn wait(&self) {
        self.latch.wait().await;
    }

    /// Waits, then returns the answer.
    pub async fn answer(&self) -> DnsAnswer {
        self.wait().await;
        self.result.get().cloned().unwrap_or_default()
    }

    /// Waits, then returns the rendered records.
    pub async fn results(&self) -> Vec<String> {
        self.answer().await.records
    }

    /// The answer, without waiting; `None` while the query is in flight.
    #[must_use]
    pub fn try_answer(&self) -> Option<&DnsAnswer> {
        self.result.get()
    }

    pub(crate) fn store(&self, answer: DnsAnswer) {
        // A job runs exactly once; a second store is unreachable.
        let _ = self.result.set(answer);
    }

    pub(crate) fn release(&self) {
        self.latch.done();
    }
}

/// A batch of jobs, waited on in order.
#[derive(Debug, Default)]
pub struct DnsJobGroup {
    jobs: Vec<std::sync::Arc<DnsJob>>,
}

impl DnsJobGroup {
    pub(crate) fn push(&mut self, job: std::sync::Arc<DnsJob>) {
        self.jobs.push(job);
    }

    #[must_use]
    pub fn jobs(&self) -> &[std::sync::Arc<DnsJob>] {
        &self.jobs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Waits until every job in the group has finished.
    pub async fn wait(&self) {
        for job in &self.jobs {
            job.wait().await;
        }
    }

    /// Waits, then returns the flattened records of all jobs.
    pub async fn results(&self) -> Vec<String> {
        let mut results = Vec::new();
        for job in &self.jobs {
            results.extend(job.results().await);
        }
        results
    }
}
