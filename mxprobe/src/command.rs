//! Line-oriented command processing, shared by stdin and the control socket.

use std::net::IpAddr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, Lines};
use tracing::warn;

use crate::{status::StatusReport, system::System};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("failed to read command input: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialise output: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] mxprobe_publish::StoreError),
}

/// Executes one command; the remaining `input` lines are its payload.
///
/// Returns the single-line output for commands that produce one.
pub async fn process_command<R>(
    command: &str,
    input: &mut Lines<R>,
    system: &System,
) -> Result<Option<String>, CommandError>
where
    R: AsyncBufRead + Unpin,
{
    match command {
        "status" => Ok(Some(serde_json::to_string(&StatusReport::gather(system))?)),

        "import-domains" => {
            while let Some(line) = input.next_line().await? {
                let domain = line.trim();
                if !domain.is_empty() {
                    system.domains.add(domain.to_string()).await;
                }
            }
            Ok(None)
        }

        "import-mx" => {
            while let Some(line) = input.next_line().await? {
                let hostname = line.trim();
                if !hostname.is_empty() {
                    system.mx.new_job(hostname).await;
                }
            }
            Ok(None)
        }

        "import-addresses" => {
            while let Some(line) = input.next_line().await? {
                let address = line.trim();
                if address.is_empty() {
                    continue;
                }
                match address.parse::<IpAddr>() {
                    Ok(address) => {
                        system
                            .hosts
                            .new_job(address, std::time::SystemTime::now())
                            .await;
                    }
                    Err(_) => warn!(%address, "skipping unparseable address"),
                }
            }
            Ok(None)
        }

        "resolve-mx" => {
            system.resolve_known_mx().await?;
            Ok(None)
        }

        "cache-mx" => Ok(Some(serde_json::to_string(&system.mx.dump())?)),

        "cache-hosts" => Ok(Some(serde_json::to_string(&system.hosts.dump())?)),

        unknown => Err(CommandError::Unknown(unknown.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use mxprobe_dns::{DnsAnswer, DnsQuery, Resolve};
    use mxprobe_probe::{HostSummary, ProbeHost};
    use mxprobe_publish::LogStore;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use crate::config::Config;

    use super::*;

    struct EmptyResolver;

    #[async_trait]
    impl Resolve for EmptyResolver {
        async fn resolve(&self, _query: &DnsQuery) -> DnsAnswer {
            DnsAnswer::default()
        }
    }

    struct IdleProbe;

    #[async_trait]
    impl ProbeHost for IdleProbe {
        async fn probe(&self, address: std::net::IpAddr) -> HostSummary {
            HostSummary::new(address)
        }
    }

    fn system() -> System {
        System::with_collaborators(
            &Config::default(),
            Arc::new(EmptyResolver),
            Arc::new(IdleProbe),
            Arc::new(LogStore),
        )
        .unwrap()
    }

    async fn run(command: &str, payload: &str, system: &System) -> Result<Option<String>, CommandError> {
        let mut lines = BufReader::new(payload.as_bytes()).lines();
        process_command(command, &mut lines, system).await
    }

    #[tokio::test]
    async fn unknown_commands_are_a_single_line_error() {
        let system = system();
        let result = run("import-everything", "", &system).await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "unknown command: import-everything"
        );
        system.close().await;
    }

    #[tokio::test]
    async fn status_is_a_json_object() {
        let system = system();
        let output = run("status", "", &system).await.unwrap().unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(parsed["dns"]["workers_max"].is_u64());
        assert!(parsed["mx"]["cache"]["entries"].is_u64());
        system.close().await;
    }

    #[tokio::test]
    async fn import_addresses_feeds_the_host_cache() {
        let system = system();
        run("import-addresses", "127.0.0.1\nnot-an-address\n", &system)
            .await
            .unwrap();

        assert_eq!(system.hosts.cache().misses(), 1);
        system.close().await;

        let dump = run("cache-hosts", "", &system).await.unwrap().unwrap();
        assert!(dump.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn import_mx_lowercases_hostnames() {
        let system = system();
        run("import-mx", "MX1.Example.TEST.\n", &system)
            .await
            .unwrap();
        system.close().await;

        let dump = run("cache-mx", "", &system).await.unwrap().unwrap();
        assert!(dump.contains("mx1.example.test"));
    }
}
