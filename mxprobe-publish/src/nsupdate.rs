//! Batched TXT publication through an external `nsupdate` process.

use std::{path::PathBuf, process::Stdio};

use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command, task::JoinHandle};
use tracing::{debug, error, info};

use mxprobe_common::strings::split_by_length;
use mxprobe_probe::txt::TXT_CHUNK_LENGTH;

fn default_server() -> String {
    "127.0.0.1".to_string()
}

const fn default_ttl() -> u32 {
    900
}

const fn default_batch_size() -> usize {
    500
}

fn default_command() -> PathBuf {
    PathBuf::from("/usr/bin/nsupdate")
}

/// Configuration of the authoritative-DNS publisher.
#[derive(Debug, Clone, Deserialize)]
pub struct NsUpdateConfig {
    /// The authoritative server receiving the updates (default: 127.0.0.1).
    #[serde(default = "default_server")]
    pub server: String,

    /// The zone the TXT records live in.
    pub zone: String,

    /// TSIG key file handed to `nsupdate -k`.
    pub key_path: PathBuf,

    /// Record TTL in seconds (default: 900).
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Maximum updates per `nsupdate` invocation (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Path of the `nsupdate` binary (default: /usr/bin/nsupdate).
    #[serde(default = "default_command")]
    pub command: PathBuf,
}

#[derive(Debug)]
struct NsUpdateJob {
    domain: String,
    txt: String,
}

/// Renders one `nsupdate` batch script: `server`/`zone` preamble, per-domain
/// delete+add pairs with chunked quoted strings, then `send`.
fn render_batch(config: &NsUpdateConfig, batch: &[NsUpdateJob]) -> String {
    let mut script = format!("server {}\nzone {}\n", config.server, config.zone);

    for job in batch {
        let name = format!("{}.{}", job.domain, config.zone);
        script.push_str(&format!("update delete {name} TXT\n"));
        script.push_str(&format!("update add {name} {} TXT", config.ttl));
        for chunk in split_by_length(&job.txt, TXT_CHUNK_LENGTH) {
            script.push_str(&format!(" \"{chunk}\""));
        }
        script.push('\n');
    }

    script.push_str("send\n");
    script
}

async fn flush(config: &NsUpdateConfig, batch: &[NsUpdateJob]) -> std::io::Result<()> {
    let mut child = Command::new(&config.command)
        .arg("-k")
        .arg(&config.key_path)
        .stdin(Stdio::piped())
        .spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("nsupdate stdin unavailable"))?;
    stdin.write_all(render_batch(config, batch).as_bytes()).await?;
    drop(stdin);

    let status = child.wait().await?;
    if status.success() {
        info!(updates = batch.len(), "nsupdate batch flushed");
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "nsupdate exited with {status}"
        )))
    }
}

async fn worker(config: NsUpdateConfig, receiver: async_channel::Receiver<NsUpdateJob>) {
    loop {
        // First job blocks; the rest of the batch is a non-blocking drain.
        let Ok(first) = receiver.recv().await else {
            info!("nsupdate worker finished");
            return;
        };

        let mut batch = vec![first];
        while batch.len() < config.batch_size {
            match receiver.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }

        debug!(updates = batch.len(), "flushing nsupdate batch");
        if let Err(flush_error) = flush(&config, &batch).await {
            // The zone would silently drift from the scan results; stop hard.
            error!("nsupdate flush failed: {flush_error}");
            std::process::exit(1);
        }
    }
}

/// Hands `(domain, txt)` pairs to an external `nsupdate` process in batches.
pub struct NsUpdater {
    sender: async_channel::Sender<NsUpdateJob>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NsUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsUpdater")
            .field("queued", &self.sender.len())
            .finish_non_exhaustive()
    }
}

impl NsUpdater {
    #[must_use]
    pub fn new(config: NsUpdateConfig) -> Self {
        let (sender, receiver) = async_channel::bounded(config.batch_size.max(1));
        let handle = tokio::spawn(worker(config, receiver));

        Self {
            sender,
            worker: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Queues one record update.
    ///
    /// # Panics
    ///
    /// Panics when called after [`close`](Self::close).
    pub async fn add(&self, domain: impl Into<String>, txt: impl Into<String>) {
        self.sender
            .send(NsUpdateJob {
                domain: domain.into(),
                txt: txt.into(),
            })
            .await
            .expect("add on a closed ns updater");
    }

    /// Closes the queue and waits for the final batch to flush.
    pub async fn close(&self) {
        self.sender.close();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
