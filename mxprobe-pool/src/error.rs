use thiserror::Error;

/// Rejected cache configurations, detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A cache must eventually drop unused entries.
    #[error("expire_after must be greater than zero")]
    ZeroExpiry,

    /// The sweeper cannot run on a zero interval.
    #[error("check_interval must be greater than zero")]
    ZeroCheckInterval,
}
