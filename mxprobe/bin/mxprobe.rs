use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use mxprobe::{
    Config, System,
    command::process_command,
    socket::ControlSocket,
};
use mxprobe_common::{Signal, logging};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Stdin},
    sync::broadcast,
};
use tracing::{error, info};

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[derive(Debug, Parser)]
#[command(
    name = "mxprobe",
    about = "Continuous STARTTLS posture scanning for mail servers",
    version
)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not listen on the control socket
    #[arg(long)]
    no_socket: bool,
}

/// Reads commands from stdin until EOF, an error, or a signal.
///
/// Command failures report on stdout and exit 1; only setup and I/O
/// failures propagate as errors.
async fn run(
    system: &System,
    lines: &mut tokio::io::Lines<BufReader<Stdin>>,
) -> anyhow::Result<ExitCode> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install the terminate handler")?;

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read commands")? {
                Some(command) => {
                    let command = command.trim().to_string();
                    if command.is_empty() {
                        continue;
                    }
                    match process_command(&command, lines, system).await {
                        Ok(Some(output)) => println!("{output}"),
                        Ok(None) => {}
                        Err(command_error) => {
                            println!("{command_error}");
                            return Ok(ExitCode::FAILURE);
                        }
                    }
                }
                None => {
                    info!("stdin closed, shutting down");
                    return Ok(ExitCode::SUCCESS);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                return Ok(ExitCode::SUCCESS);
            }
            _ = terminate.recv() => {
                info!("terminate received, shutting down");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    logging::init(&config.log);

    let system = Arc::new(System::new(&config).context("failed to build the pipeline")?);

    let (shutdown, _) = broadcast::channel(8);

    let socket = (!args.no_socket).then(|| {
        let socket = ControlSocket::new(&config.socket_path);
        let system = Arc::clone(&system);
        let receiver = shutdown.subscribe();
        tokio::spawn(async move { socket.serve(system, receiver).await })
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = run(&system, &mut lines).await;

    let _ = shutdown.send(Signal::Shutdown);
    if let Some(socket) = socket {
        match socket.await {
            Ok(Ok(())) => {}
            Ok(Err(socket_error)) => error!("control socket failed: {socket_error}"),
            Err(join_error) => error!("control socket task failed: {join_error}"),
        }
    }

    system.close().await;
    code
}
