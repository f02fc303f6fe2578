//! Switchboard Daemon - Multi-Provider AI Router Server
//!
//! Runs the provider router and alert monitor as a long-lived process and
//! serves dispatch and admin requests over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! switchboard-daemon
//!
//! # Custom socket path
//! switchboard-daemon --socket-path /tmp/switchboard.sock
//!
//! # With config file
//! switchboard-daemon --config /etc/switchboard/router.toml
//!
//! # Daemonize (run in background)
//! switchboard-daemon --daemonize
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Reload thresholds and timeouts from the config file

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use switchboard_core::{
    default_config_path, load_config_from_path, AiServiceManager, HttpProviderClient, ProviderId,
    SystemClock,
};

use server::DaemonServer;

/// Switchboard Daemon - routes chat requests across AI providers
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, env = "SWITCHBOARD_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path
    #[arg(long, env = "SWITCHBOARD_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Directory for the socket and PID file
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/switchboard-$UID/`
fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("switchboard")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/switchboard-{uid}"))
    }
}

fn default_socket_path() -> PathBuf {
    runtime_dir().join("switchboard.sock")
}

fn default_pid_path() -> PathBuf {
    runtime_dir().join("switchboard.pid")
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start when the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in {pid_path:?}"))?;

    // Signal 0 only checks that the process exists
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another switchboard-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_daemon={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Fork to the background
///
/// Must run before the tokio runtime exists; forking copies only the
/// calling thread.
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // Second fork so the daemon can never reacquire a controlling terminal
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

/// Build the service, install signal handlers and serve until shutdown
async fn serve(socket_path: PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from_path(config_path.clone().or_else(default_config_path))
        .context("Failed to load configuration")?;
    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        "Configuration loaded"
    );

    let client =
        HttpProviderClient::new(&config.endpoints).context("Failed to build HTTP client")?;
    for id in ProviderId::ALL {
        if config.profiles[id].enabled && !client.has_credentials(id) {
            warn!(
                provider = %id,
                env = %config.endpoints[id].api_key_env,
                "No API key in environment, provider will not be selected"
            );
        }
    }

    let service = Arc::new(
        AiServiceManager::new(&config, Arc::new(client), SystemClock::shared())
            .context("Failed to build AI service manager")?,
    );
    service.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload_config = Arc::new(AtomicBool::new(false));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let shutdown_clone = Arc::clone(&shutdown);
    let reload_clone = Arc::clone(&reload_config);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown_clone.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_clone.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, marking config for reload");
                    reload_clone.store(true, Ordering::SeqCst);
                }
            }
        }
    });

    let mut server = DaemonServer::new(socket_path, config_path, Arc::clone(&service));
    let result = server.run(shutdown, reload_config).await;

    service.shutdown();
    result
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Switchboard daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let socket_path = args.socket_path.unwrap_or_else(default_socket_path);
    let pid_path = args.pid_file.unwrap_or_else(default_pid_path);

    info!(socket_path = ?socket_path, "Socket path");
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_daemon(&pid_path)?;

    if args.daemonize {
        info!("Daemonizing...");
        daemonize()?;
    }
    info!("PID: {}", std::process::id());

    write_pid_file(&pid_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(serve(socket_path.clone(), args.config));

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    match result {
        Ok(()) => {
            info!("Switchboard daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
