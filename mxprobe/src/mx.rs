//! The per-MX-hostname stage: resolve addresses, probe them, aggregate.

use std::{collections::BTreeMap, net::IpAddr, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use mxprobe_common::strings::unique;
use mxprobe_dns::{DnsProcessor, RecordType};
use mxprobe_pool::{CacheConfig, CacheEntry, CachedWorkerPool, Work, cache::CacheEntrySnapshot};
use mxprobe_probe::TxtRecord;
use mxprobe_publish::{Finding, NsUpdater, ResultProcessor};
use tracing::warn;

use crate::host::HostProcessor;

const ADDRESS_TYPES: [RecordType; 2] = [RecordType::A, RecordType::AAAA];

struct MxWork {
    dns: Arc<DnsProcessor>,
    hosts: Arc<HostProcessor>,
    results: Option<Arc<ResultProcessor>>,
    ns: Option<Arc<NsUpdater>>,
}

#[async_trait]
impl Work<Arc<CacheEntry<String>>> for MxWork {
    async fn run(&self, entry: Arc<CacheEntry<String>>) {
        let hostname = String::from_utf8_lossy(entry.key()).into_owned();
        // The entry's own access time flows into the host cache below, so
        // hosts stay exactly as hot as the MX hostnames that need them.
        let accessed = entry.accessed();

        let group = self.dns.new_jobs(&hostname, &ADDRESS_TYPES).await;
        group.wait().await;
        let records = group.results().await;

        if let Some(results) = &self.results {
            results.add(Finding::DnsGroup(group)).await;
        }

        let addresses = unique(&records);

        let mut handles = Vec::with_capacity(addresses.len());
        for address in &addresses {
            match address.parse::<IpAddr>() {
                Ok(address) => handles.push(self.hosts.new_job(address, accessed).await),
                Err(_) => warn!(%hostname, %address, "skipping unparseable address"),
            }
        }

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            handle.wait().await;
            if let Some(summary) = handle.value() {
                summaries.push(summary);
            }
        }

        let record = TxtRecord::from_hosts(&hostname, &summaries);
        let txt = record.to_string();
        entry.set_value(txt.clone());

        if let Some(ns) = &self.ns {
            ns.add(hostname.clone(), txt).await;
        }
        if let Some(results) = &self.results {
            results.add(Finding::MxRecord { hostname, record }).await;
        }
    }
}

/// A [`CachedWorkerPool`] keyed by lowercased MX hostname; the value is the
/// rendered TXT record text.
pub struct MxProcessor {
    cache: CachedWorkerPool<String>,
}

impl std::fmt::Debug for MxProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxProcessor")
            .field("cache", &self.cache)
            .finish()
    }
}

impl MxProcessor {
    #[must_use]
    pub fn new(
        max_workers: u32,
        dns: Arc<DnsProcessor>,
        hosts: Arc<HostProcessor>,
        results: Option<Arc<ResultProcessor>>,
        ns: Option<Arc<NsUpdater>>,
        cache_config: Option<CacheConfig>,
    ) -> Self {
        Self {
            cache: CachedWorkerPool::new(
                max_workers,
                Arc::new(MxWork {
                    dns,
                    hosts,
                    results,
                    ns,
                }),
                cache_config,
            ),
        }
    }

    /// Returns the cache entry for `hostname`, resolving and probing it on a
    /// miss.
    pub async fn new_job(&self, hostname: &str) -> Arc<CacheEntry<String>> {
        let key = hostname.trim_end_matches('.').to_lowercase();
        self.cache.new_job(key.as_bytes(), SystemTime::now()).await
    }

    /// The DNS-server integration point: the rendered TXT text for
    /// `hostname`, or `None` until the first aggregation completes.
    ///
    /// A miss still enqueues the hostname, so front-ends answering SERVFAIL
    /// on `None` warm the cache for the client's retry.
    pub async fn get_value(&self, hostname: &str) -> Option<String> {
        self.new_job(hostname).await.value()
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }

    #[must_use]
    pub fn cache(&self) -> &CachedWorkerPool<String> {
        &self.cache
    }

    /// Cache contents keyed by hostname.
    #[must_use]
    pub fn dump(&self) -> BTreeMap<String, CacheEntrySnapshot<String>> {
        self.cache
            .dump()
            .into_iter()
            .map(|(key, snapshot)| (String::from_utf8_lossy(&key).into_owned(), snapshot))
            .collect()
    }
}
