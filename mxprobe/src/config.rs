//! Scanner configuration, loaded from a TOML file.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use mxprobe_common::logging::LogConfig;
use mxprobe_dns::ResolverMode;
use mxprobe_pool::CacheConfig;
use mxprobe_probe::ProbeConfig;
use mxprobe_publish::NsUpdateConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid cache configuration: {0}")]
    Cache(#[from] mxprobe_pool::ConfigError),

    #[error("trust anchor required for the validating resolver")]
    MissingTrustAnchor,

    #[error("trust anchor not found: {0}")]
    TrustAnchorNotFound(PathBuf),
}

const fn default_dns_workers() -> u32 {
    50
}

const fn default_domain_workers() -> u32 {
    10
}

const fn default_mx_workers() -> u32 {
    100
}

const fn default_host_workers() -> u32 {
    200
}

const fn default_result_workers() -> u32 {
    2
}

/// Worker caps per pool.
///
/// The MX and host pools default to at least the DNS pool's size: an MX
/// worker blocks on DNS answers, so a smaller DNS pool would starve it.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_dns_workers")]
    pub dns: u32,

    #[serde(default = "default_domain_workers")]
    pub domain: u32,

    #[serde(default = "default_mx_workers")]
    pub mx: u32,

    #[serde(default = "default_host_workers")]
    pub host: u32,

    #[serde(default = "default_result_workers")]
    pub result: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            dns: default_dns_workers(),
            domain: default_domain_workers(),
            mx: default_mx_workers(),
            host: default_host_workers(),
            result: default_result_workers(),
        }
    }
}

const fn default_dns_timeout_secs() -> u64 {
    5
}

const fn default_resolver_mode() -> ResolverMode {
    ResolverMode::Stub
}

/// Resolver backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// `validating` or `stub` (default: stub).
    #[serde(default = "default_resolver_mode")]
    pub mode: ResolverMode,

    /// Upstream resolver address; system configuration when unset.
    #[serde(default)]
    pub upstream: Option<SocketAddr>,

    /// Query timeout in seconds (default: 5).
    #[serde(default = "default_dns_timeout_secs")]
    pub timeout_secs: u64,

    /// DNSSEC trust anchor file, required in validating mode.
    #[serde(default)]
    pub trust_anchor: Option<PathBuf>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            mode: default_resolver_mode(),
            upstream: None,
            timeout_secs: default_dns_timeout_secs(),
            trust_anchor: None,
        }
    }
}

impl DnsConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == ResolverMode::Validating {
            let anchor = self
                .trust_anchor
                .as_ref()
                .ok_or(ConfigError::MissingTrustAnchor)?;
            if !anchor.exists() {
                return Err(ConfigError::TrustAnchorNotFound(anchor.clone()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const fn default_expire_after_secs() -> u64 {
    86_400
}

const fn default_refresh_after_secs() -> u64 {
    3_600
}

const fn default_check_interval_secs() -> u64 {
    60
}

/// Per-stage cache policy. `expire_after_secs = 0` disables the cache for
/// that stage entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_expire_after_secs")]
    pub expire_after_secs: u64,

    #[serde(default = "default_refresh_after_secs")]
    pub refresh_after_secs: u64,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            expire_after_secs: default_expire_after_secs(),
            refresh_after_secs: default_refresh_after_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl CacheSection {
    pub(crate) fn cache_config(&self) -> Result<Option<CacheConfig>, ConfigError> {
        if self.expire_after_secs == 0 {
            return Ok(None);
        }
        Ok(Some(CacheConfig::new(
            Duration::from_secs(self.expire_after_secs),
            Duration::from_secs(self.refresh_after_secs),
            Duration::from_secs(self.check_interval_secs),
        )?))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CachesConfig {
    #[serde(default)]
    pub mx: CacheSection,

    #[serde(default)]
    pub host: CacheSection,
}

/// External result store settings. The DSN is handed to the store
/// implementation verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub dsn: Option<String>,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/mxprobe.sock")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default, alias = "cache")]
    pub caches: CachesConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// TXT publication; absent means no authoritative zone is updated.
    #[serde(default)]
    pub nsupdate: Option<NsUpdateConfig>,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            workers: WorkersConfig::default(),
            dns: DnsConfig::default(),
            probe: ProbeConfig::default(),
            caches: CachesConfig::default(),
            store: StoreConfig::default(),
            nsupdate: None,
            socket_path: default_socket_path(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&std::fs::read_to_string(path)?)?;
        config.dns.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_keep_probing_pools_at_least_as_wide_as_dns() {
        let workers = WorkersConfig::default();
        assert!(workers.mx >= workers.dns);
        assert!(workers.host >= workers.dns);
    }

    #[test]
    fn an_empty_file_yields_the_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.workers.dns, 50);
        assert_eq!(config.probe.port, 25);
        assert!(config.nsupdate.is_none());
        assert!(config.caches.mx.cache_config().unwrap().is_some());
    }

    #[test]
    fn zero_expiry_disables_a_stage_cache() {
        let config: Config = toml::from_str(
            "[cache.host]\n\
             expire_after_secs = 0\n",
        )
        .unwrap();
        assert!(config.caches.host.cache_config().unwrap().is_none());
        assert!(config.caches.mx.cache_config().unwrap().is_some());
    }

    #[test]
    fn validating_mode_requires_an_existing_trust_anchor() {
        let config: Config = toml::from_str(
            "[dns]\n\
             mode = \"validating\"\n",
        )
        .unwrap();
        assert!(matches!(
            config.dns.validate(),
            Err(ConfigError::MissingTrustAnchor)
        ));

        let config: Config = toml::from_str(
            "[dns]\n\
             mode = \"validating\"\n\
             trust_anchor = \"/nonexistent/root.key\"\n",
        )
        .unwrap();
        assert!(matches!(
            config.dns.validate(),
            Err(ConfigError::TrustAnchorNotFound(_))
        ));
    }

    #[test]
    fn log_section_parses_level_and_timestamps() {
        let config: Config = toml::from_str(
            "[log]\n\
             level = \"debug\"\n\
             timestamps = false\n",
        )
        .unwrap();

        assert_eq!(
            config.log.level,
            Some(mxprobe_common::logging::LogLevel::Debug)
        );
        assert!(!config.log.timestamps);
    }

    #[test]
    fn nsupdate_section_parses_with_defaults() {
        let config: Config = toml::from_str(
            "[nsupdate]\n\
             zone = \"tls-scan.example.test\"\n\
             key_path = \"/etc/mxprobe/nsupdate.key\"\n",
        )
        .unwrap();

        let nsupdate = config.nsupdate.unwrap();
        assert_eq!(nsupdate.server, "127.0.0.1");
        assert_eq!(nsupdate.ttl, 900);
        assert_eq!(nsupdate.batch_size, 500);
    }
}
