//! vtmuxd: headless terminal multiplexer server
//!
//! Hosts any number of PTY sessions behind a single Unix socket, emitting a
//! redraw protocol (§4.5) to attached clients instead of raw bytes. Clients
//! (not part of this crate) render the redraw stream into a terminal UI.
//!
//! Usage:
//!   vtmuxd --name mysession

mod client;
mod codec;
mod error;
mod eventloop;
mod frame;
mod pty;
mod redraw;
mod rpc;
mod server;
mod session;
mod session_store;
mod style;

use anyhow::{Context, Result};
use clap::Parser;
use server::Server;
use session_store::JsonSessionStore;
use std::io;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Headless terminal multiplexer server
#[derive(Parser, Debug)]
#[command(name = "vtmuxd")]
#[command(about = "Headless terminal multiplexer server")]
#[command(version)]
struct Args {
    /// Server identifier; used to derive the default socket path and session
    /// state directory.
    #[arg(short, long, default_value = "vtmuxd")]
    name: String,

    /// Unix socket path (default: /tmp/<name>-<uid>.sock)
    #[arg(short, long)]
    socket: Option<String>,

    /// Directory for session JSON files (default: $HOME/.local/state/<name>/sessions)
    #[arg(long)]
    state_dir: Option<String>,

    /// Default terminal rows for newly spawned PTYs that don't specify one
    #[arg(long, default_value = "24")]
    rows: u16,

    /// Default terminal columns for newly spawned PTYs that don't specify one
    #[arg(long, default_value = "80")]
    cols: u16,

    /// Shell (or other program) to run in newly spawned PTYs (default: $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (tees tracing output to a file in addition to stderr)
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if let Some(ref log_path) = args.log_file {
        if let Some(parent) = std::path::Path::new(log_path).parent() {
            std::fs::create_dir_all(parent).context("failed to create log directory")?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed to open log file: {log_path}"))?;
        subscriber.with_writer(move || file.try_clone().expect("log file clone")).init();
    } else {
        subscriber.with_writer(io::stderr).init();
    }

    info!("vtmuxd v{}", env!("CARGO_PKG_VERSION"));
    info!("name: {}", args.name);

    // SIGPIPE defaults to terminating the process in a plain C program; Rust
    // normally ignores it already, but we say so explicitly per §6.
    unsafe {
        nix::libc::signal(nix::libc::SIGPIPE, nix::libc::SIG_IGN);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let uid = unsafe { nix::libc::getuid() };

    let socket_path = args.socket.unwrap_or_else(|| format!("/tmp/{}-{}.sock", args.name, uid));

    let state_dir = args
        .state_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&home).join(".local/state").join(&args.name).join("sessions"));
    std::fs::create_dir_all(&state_dir).context("failed to create session state directory")?;

    info!("socket: {socket_path}");
    info!("session state dir: {}", state_dir.display());

    let shell = args
        .shell
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string());
    let default_command = vec![shell];

    let session_store = JsonSessionStore::new(state_dir);
    let mut server = Server::new(default_command, Box::new(session_store));
    server.default_rows = args.rows;
    server.default_cols = args.cols;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigchld = signal(SignalKind::child())?;

    // SIGCHLD just needs to be drained so the signal stream doesn't pile up;
    // `eventloop::run` already reaps exited children on every loop tick via
    // waitpid(WNOHANG), matching the teacher's own belt-and-suspenders
    // polling in `Pty::check_child`.
    tokio::spawn(async move {
        loop {
            sigchld.recv().await;
        }
    });

    let run_result = tokio::select! {
        result = eventloop::run(&mut server, &socket_path) => result,
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            Ok(())
        }
    };

    if let Err(e) = &run_result {
        error!("event loop error: {e}");
    }

    info!("shutting down...");
    server.shutdown();
    eventloop::flush_all_outbound(&mut server).await;
    let _ = std::fs::remove_file(&socket_path);
    info!("goodbye");
    run_result
}
