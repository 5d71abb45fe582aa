//! Log output for the scanner binaries.
//!
//! The minimum level comes from the configuration file; the `LOG_LEVEL`
//! environment variable wins when set, so an operator can turn probing noise
//! on without touching the deployed config.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

const fn default_timestamps() -> bool {
    true
}

/// Logging section of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Minimum level for scanner events. Debug builds default to `trace`,
    /// release builds to `info`.
    #[serde(default)]
    pub level: Option<LogLevel>,

    /// Prefix every line with a UTC timestamp (default: true). Off is
    /// useful under journald, which stamps lines itself.
    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            timestamps: default_timestamps(),
        }
    }
}

impl LogConfig {
    fn level_filter(&self) -> LevelFilter {
        let built_in = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        std::env::var("LOG_LEVEL")
            .ok()
            .as_deref()
            .and_then(LogLevel::parse)
            .or(self.level)
            .map_or(built_in, LevelFilter::from)
    }
}

struct Stamp;

impl FormatTime for Stamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// Installs the global subscriber. Call once, before the pipeline starts.
pub fn init(config: &LogConfig) {
    // Only scanner targets pass; dependency chatter stays off entirely.
    let targets = Targets::new().with_target("mxprobe", config.level_filter());

    let format = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false);

    if config.timestamps {
        tracing_subscriber::registry()
            .with(format.with_timer(Stamp).with_filter(targets))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(format.without_time().with_filter(targets))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_onto_filters() {
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn timestamps_default_on() {
        let config = LogConfig::default();
        assert!(config.timestamps);
        assert!(config.level.is_none());
    }
}
