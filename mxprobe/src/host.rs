//! The per-address probing stage.

use std::{collections::BTreeMap, net::IpAddr, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use mxprobe_pool::{
    CacheConfig, CacheEntry, CachedWorkerPool, Work,
    cache::CacheEntrySnapshot,
};
use mxprobe_probe::{HostSummary, ProbeHost};
use mxprobe_publish::{Finding, ResultProcessor};
use tracing::error;

/// Cache key: the 4- or 16-byte address representation.
fn key_of(address: IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn address_of(key: &[u8]) -> Option<IpAddr> {
    match key.len() {
        4 => <[u8; 4]>::try_from(key).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(key).ok().map(IpAddr::from),
        _ => None,
    }
}

struct HostWork {
    probe: Arc<dyn ProbeHost>,
    results: Option<Arc<ResultProcessor>>,
}

#[async_trait]
impl Work<Arc<CacheEntry<HostSummary>>> for HostWork {
    async fn run(&self, entry: Arc<CacheEntry<HostSummary>>) {
        let Some(address) = address_of(entry.key()) else {
            // Keys are built by `new_job`; anything else is a wiring bug.
            error!(key = ?entry.key(), "host entry with a malformed address key");
            return;
        };

        let summary = self.probe.probe(address).await;
        entry.set_value(summary.clone());

        if let Some(results) = &self.results {
            if !summary.certificates.is_empty() {
                results
                    .add(Finding::Certificates(summary.certificates.clone()))
                    .await;
            }
            results.add(Finding::Host(summary)).await;
        }
    }
}

/// A [`CachedWorkerPool`] whose work is one STARTTLS probe per address.
pub struct HostProcessor {
    cache: CachedWorkerPool<HostSummary>,
}

impl std::fmt::Debug for HostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProcessor")
            .field("cache", &self.cache)
            .finish()
    }
}

impl HostProcessor {
    #[must_use]
    pub fn new(
        max_workers: u32,
        probe: Arc<dyn ProbeHost>,
        results: Option<Arc<ResultProcessor>>,
        cache_config: Option<CacheConfig>,
    ) -> Self {
        Self {
            cache: CachedWorkerPool::new(
                max_workers,
                Arc::new(HostWork { probe, results }),
                cache_config,
            ),
        }
    }

    /// Returns the cache entry for `address`, probing it on a miss.
    ///
    /// `accessed` propagates the caller's access recency: an MX-triggered
    /// probe keeps the host entry as hot as the MX entry that needs it.
    pub async fn new_job(
        &self,
        address: IpAddr,
        accessed: SystemTime,
    ) -> Arc<CacheEntry<HostSummary>> {
        self.cache.new_job(&key_of(address), accessed).await
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }

    #[must_use]
    pub fn cache(&self) -> &CachedWorkerPool<HostSummary> {
        &self.cache
    }

    /// Cache contents keyed by displayable address.
    #[must_use]
    pub fn dump(&self) -> BTreeMap<String, CacheEntrySnapshot<HostSummary>> {
        self.cache
            .dump()
            .into_iter()
            .filter_map(|(key, snapshot)| {
                address_of(&key).map(|address| (address.to_string(), snapshot))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_for_both_families() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::25".parse().unwrap();

        assert_eq!(key_of(v4).len(), 4);
        assert_eq!(key_of(v6).len(), 16);
        assert_eq!(address_of(&key_of(v4)), Some(v4));
        assert_eq!(address_of(&key_of(v6)), Some(v6));
        assert_eq!(address_of(b"bad"), None);
    }
}
