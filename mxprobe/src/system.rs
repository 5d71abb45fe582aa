//! Explicit composition of every processor in the pipeline.

use std::sync::Arc;

use mxprobe_dns::{DnsProcessor, HickoryResolver, Resolve};
use mxprobe_probe::SmtpProbe;
use mxprobe_publish::{LogStore, NsUpdater, ResultProcessor, ResultStore, StoreError};
use thiserror::Error;
use tracing::info;

use crate::{
    config::{Config, ConfigError},
    domain::DomainProcessor,
    host::HostProcessor,
    mx::MxProcessor,
};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("probe setup failed: {0}")]
    Probe(#[from] mxprobe_probe::SetupError),
}

/// Owns every processor and wires them together; there is no ambient state.
pub struct System {
    pub dns: Arc<DnsProcessor>,
    pub domains: Arc<DomainProcessor>,
    pub mx: Arc<MxProcessor>,
    pub hosts: Arc<HostProcessor>,
    pub results: Arc<ResultProcessor>,
    pub ns: Option<Arc<NsUpdater>>,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System").finish_non_exhaustive()
    }
}

impl System {
    /// Builds the pipeline bottom-up: sinks, then DNS, then the host, MX and
    /// domain stages.
    pub fn new(config: &Config) -> Result<Self, SystemError> {
        config.dns.validate()?;
        Self::with_collaborators(
            config,
            Arc::new(HickoryResolver::new(
                config.dns.mode,
                config.dns.upstream,
                config.dns.timeout(),
            )),
            Arc::new(SmtpProbe::new(config.probe.clone())?),
            Arc::new(LogStore),
        )
    }

    /// Composition seam: tests inject resolver, probe and store doubles.
    pub fn with_collaborators(
        config: &Config,
        resolver: Arc<dyn Resolve>,
        probe: Arc<dyn mxprobe_probe::ProbeHost>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, SystemError> {
        let results = Arc::new(ResultProcessor::new(config.workers.result, store));
        let ns = config
            .nsupdate
            .clone()
            .map(|nsupdate| Arc::new(NsUpdater::new(nsupdate)));
        if let Some(nsupdate) = &config.nsupdate {
            info!(zone = %nsupdate.zone, "TXT publication enabled");
        }

        let dns = Arc::new(DnsProcessor::new(config.workers.dns, resolver));

        let hosts = Arc::new(HostProcessor::new(
            config.workers.host,
            probe,
            Some(Arc::clone(&results)),
            config.caches.host.cache_config()?,
        ));

        let mx = Arc::new(MxProcessor::new(
            config.workers.mx,
            Arc::clone(&dns),
            Arc::clone(&hosts),
            Some(Arc::clone(&results)),
            ns.clone(),
            config.caches.mx.cache_config()?,
        ));

        let domains = Arc::new(DomainProcessor::new(
            config.workers.domain,
            Arc::clone(&dns),
            Arc::clone(&mx),
            Some(Arc::clone(&results)),
        ));

        Ok(Self {
            dns,
            domains,
            mx,
            hosts,
            results,
            ns,
        })
    }

    /// Re-feeds every MX hostname the store already knows about.
    pub async fn resolve_known_mx(&self) -> Result<usize, StoreError> {
        let hostnames = self.results.store().mx_hostnames().await?;
        let count = hostnames.len();
        for hostname in hostnames {
            self.mx.new_job(&hostname).await;
        }
        Ok(count)
    }

    /// Closes the pipeline from the producing end, draining each stage
    /// before its consumers.
    pub async fn close(&self) {
        self.domains.close().await;
        self.mx.close().await;
        self.hosts.close().await;
        self.dns.close().await;
        self.results.close().await;
        if let Some(ns) = &self.ns {
            ns.close().await;
        }
        info!("pipeline closed");
    }
}
