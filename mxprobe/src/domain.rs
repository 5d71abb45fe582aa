//! The entry stage: MX-resolve a domain, feed its hostnames onward.

use std::sync::Arc;

use async_trait::async_trait;
use mxprobe_common::strings::unique;
use mxprobe_dns::{DnsProcessor, RecordType};
use mxprobe_pool::{PoolStatus, Work, WorkerPool};
use mxprobe_publish::{Finding, ResultProcessor};

use crate::mx::MxProcessor;

struct DomainWork {
    dns: Arc<DnsProcessor>,
    mx: Arc<MxProcessor>,
    results: Option<Arc<ResultProcessor>>,
}

#[async_trait]
impl Work<String> for DomainWork {
    async fn run(&self, domain: String) {
        let job = self.dns.new_job(&domain, RecordType::MX).await;
        job.wait().await;

        for hostname in unique(&job.results().await) {
            self.mx.new_job(&hostname).await;
        }

        if let Some(results) = &self.results {
            results.add(Finding::Dns(job)).await;
        }
    }
}

/// Plain worker pool feeding domains into the pipeline; domains carry no
/// cacheable state of their own.
pub struct DomainProcessor {
    pool: WorkerPool<String>,
}

impl std::fmt::Debug for DomainProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainProcessor")
            .field("pool", &self.pool)
            .finish()
    }
}

impl DomainProcessor {
    #[must_use]
    pub fn new(
        max_workers: u32,
        dns: Arc<DnsProcessor>,
        mx: Arc<MxProcessor>,
        results: Option<Arc<ResultProcessor>>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(
                max_workers,
                Arc::new(DomainWork { dns, mx, results }) as Arc<dyn Work<String>>,
            ),
        }
    }

    pub async fn add(&self, domain: String) {
        self.pool.add(domain).await;
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}
