//! Read-only counter snapshot across every pool and cache.

use mxprobe_pool::{CacheStatus, PoolStatus};
use serde::Serialize;

use crate::system::System;

#[derive(Debug, Clone, Serialize)]
pub struct CachedPoolStatus {
    #[serde(flatten)]
    pub pool: PoolStatus,
    pub cache: CacheStatus,
}

/// The `status` command payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub dns: PoolStatus,
    pub domain: PoolStatus,
    pub mx: CachedPoolStatus,
    pub host: CachedPoolStatus,
    pub result: PoolStatus,
}

impl StatusReport {
    /// Best-effort, unsynchronised reads; the counters are monotonic.
    #[must_use]
    pub fn gather(system: &System) -> Self {
        Self {
            dns: system.dns.status(),
            domain: system.domains.status(),
            mx: CachedPoolStatus {
                pool: system.mx.cache().pool().status(),
                cache: system.mx.cache().cache_status(),
            },
            host: CachedPoolStatus {
                pool: system.hosts.cache().pool().status(),
                cache: system.hosts.cache().cache_status(),
            },
            result: system.results.status(),
        }
    }
}
