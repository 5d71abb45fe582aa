//! Unix control socket speaking the line-oriented command protocol.

use std::{path::PathBuf, sync::Arc};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use mxprobe_common::Signal;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info};

use crate::{command::process_command, system::System};

pub struct ControlSocket {
    path: PathBuf,
}

impl ControlSocket {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Serves commands until a shutdown signal arrives.
    pub async fn serve(
        &self,
        system: Arc<System>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> std::io::Result<()> {
        if self.path.exists() {
            // An answering socket means another instance owns the path.
            if UnixStream::connect(&self.path).await.is_ok() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("socket already in use: {}", self.path.display()),
                ));
            }
            info!("removing stale socket file: {}", self.path.display());
            tokio::fs::remove_file(&self.path).await?;
        }

        let listener = UnixListener::bind(&self.path)?;

        #[cfg(unix)]
        {
            let metadata = tokio::fs::metadata(&self.path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            tokio::fs::set_permissions(&self.path, permissions).await?;
        }
        info!("control socket listening on {}", self.path.display());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let system = Arc::clone(&system);
                            tokio::spawn(async move {
                                if let Err(connection_error) = handle_connection(stream, system).await {
                                    error!("control connection failed: {connection_error}");
                                }
                            });
                        }
                        Err(accept_error) => error!("control accept failed: {accept_error}"),
                    }
                }
                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!("control socket shutting down");
                            break;
                        }
                        Err(recv_error) => {
                            error!("control shutdown channel failed: {recv_error}");
                            break;
                        }
                    }
                }
            }
        }

        if self.path.exists() {
            debug!("removing socket file: {}", self.path.display());
            let _ = tokio::fs::remove_file(&self.path).await;
        }

        Ok(())
    }
}

/// One connection, one command: the first line names it, the rest is payload.
async fn handle_connection(stream: UnixStream, system: Arc<System>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let Some(command) = lines.next_line().await? else {
        return Ok(());
    };

    match process_command(command.trim(), &mut lines, &system).await {
        Ok(Some(output)) => {
            write.write_all(output.as_bytes()).await?;
            write.write_all(b"\n").await?;
        }
        Ok(None) => {}
        Err(command_error) => {
            write
                .write_all(format!("{command_error}\n").as_bytes())
                .await?;
        }
    }

    write.shutdown().await
}
