//! PaneHub Daemon
//!
//! Runs interactive sessions and relays them to websocket observers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::pidfile::{remove_pid_file, write_pid_file};
use daemon::ipc::{get_daemon_pid, get_socket_path, is_daemon_running, IpcClient, IpcResponse};
use daemon::service::{load_token_authority, DaemonService, ServiceEvent};
use protocol::{CredentialVerifier, PasswordHash, SessionInfo};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// PaneHub Daemon - session orchestrator and websocket relay.
#[derive(Parser, Debug)]
#[command(name = "panehub-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the PaneHub daemon
    Start {
        /// Address for the relay to listen on (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Print a password hash for the [security] section
    HashPassword {
        /// Password to hash
        #[arg(env = "PANEHUB_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Issue an access token for relay observers
    Token {
        /// Password checked against the configured hash
        #[arg(long, short, env = "PANEHUB_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Destroy a session
    Destroy {
        /// Session ID to destroy
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(cli.verbose, &config)?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Start { bind } => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  panehub-daemon stop");
                std::process::exit(1);
            }

            if let Some(addr) = bind {
                config.network.bind_addr = addr;
                config.validate()?;
            }
            if config.security.password_hash.is_none() {
                tracing::warn!("No password hash configured; `panehub-daemon token` will not ask for a password");
            }

            let mut service = DaemonService::new(config)?;
            run_daemon(&mut service).await?;
        }
        Commands::Stop { force, timeout } => {
            let result = if force {
                force_stop_daemon()
            } else {
                graceful_stop_daemon(timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: panehub-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_daemon_status().await {
            Ok(status) => {
                println!(
                    "Daemon Status: {}",
                    if status.running { "running" } else { "stopping" }
                );
                println!("  Listening: {}", status.bind_addr);
                println!("  Uptime:    {}", format_duration(status.uptime_secs));
                println!("  Sessions:  {}", status.session_count);
                println!("  Observers: {}", status.observer_count);
            }
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => match query_sessions_list().await {
                Ok(sessions) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions, Utc::now());
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            },
            SessionsCommands::Destroy { session_id } => {
                match destroy_session(&session_id).await {
                    Ok(()) => println!("Session {} destroyed", session_id),
                    Err(e) => {
                        eprintln!("Failed to destroy session {}: {}", session_id, e);
                        std::process::exit(1);
                    }
                }
            }
        },
        Commands::HashPassword { password } => {
            if password.is_empty() {
                anyhow::bail!("Password must not be empty");
            }
            println!("{}", PasswordHash::create(&password));
        }
        Commands::Token { password } => {
            match config.password_hash()? {
                Some(hash) => {
                    let password = password
                        .context("A password is required (use --password or PANEHUB_PASSWORD)")?;
                    if !hash.verify(&password) {
                        anyhow::bail!("Invalid password");
                    }
                }
                None => {
                    eprintln!("Warning: no password hash configured; issuing token without a password check");
                }
            }

            let authority = load_token_authority(&config)?;
            println!("{}", authority.issue()?);
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug and the
/// configured level applies. The returned guard flushes the log file on drop.
fn init_tracing(verbose: bool, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &config.daemon.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("log_file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Run the daemon until a signal or an IPC stop request.
async fn run_daemon(service: &mut DaemonService) -> anyhow::Result<()> {
    let pid_path = write_pid_file().context("Failed to write PID file")?;
    tracing::debug!(path = %pid_path.display(), "Wrote PID file");

    if let Err(e) = service.start().await {
        remove_pid_file();
        return Err(e);
    }
    if let Some(addr) = service.local_addr() {
        println!("PaneHub relay listening on ws://{}", addr);
    }

    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServiceEvent::StateChanged(state) => {
                    tracing::debug!(state = ?state, "Service state changed");
                }
                ServiceEvent::StopRequested => {
                    tracing::info!("Stop requested");
                }
            }
        }
    });

    let shutdown = service.shutdown_token();
    let outcome = tokio::select! {
        result = wait_for_shutdown_signal() => result,
        _ = shutdown.cancelled() => Ok(()),
    };

    let stopped = service.stop().await;
    remove_pid_file();
    outcome.and(stopped)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

/// Status information returned from the daemon.
struct DaemonStatus {
    running: bool,
    uptime_secs: u64,
    session_count: usize,
    observer_count: usize,
    bind_addr: String,
}

async fn connect_daemon() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Query the daemon status via IPC.
async fn query_daemon_status() -> anyhow::Result<DaemonStatus> {
    let mut client = connect_daemon().await?;
    let response = client.status().await.context("Failed to query status")?;

    match response {
        IpcResponse::Status {
            running,
            uptime_secs,
            session_count,
            observer_count,
            bind_addr,
        } => Ok(DaemonStatus {
            running,
            uptime_secs,
            session_count,
            observer_count,
            bind_addr,
        }),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Query the list of live sessions from the daemon.
async fn query_sessions_list() -> anyhow::Result<Vec<SessionInfo>> {
    let mut client = connect_daemon().await?;
    let response = client
        .list_sessions()
        .await
        .context("Failed to query sessions")?;

    match response {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Destroy a session by ID via IPC.
async fn destroy_session(session_id: &str) -> anyhow::Result<()> {
    let mut client = connect_daemon().await?;
    let response = client
        .destroy_session(session_id.to_string())
        .await
        .context("Failed to send destroy request")?;

    match response {
        IpcResponse::SessionDestroyed { session_id: destroyed } if destroyed == session_id => {
            Ok(())
        }
        IpcResponse::SessionDestroyed { session_id: other } => {
            anyhow::bail!("Unexpected session destroyed: {}", other)
        }
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Print sessions in a formatted table.
fn print_sessions_table(sessions: &[SessionInfo], now: DateTime<Utc>) {
    if sessions.is_empty() {
        println!("No live sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);
    let title_width = sessions
        .iter()
        .map(|s| s.title.chars().count())
        .max()
        .unwrap_or(5)
        .clamp(5, 24);

    println!(
        "{:<id_width$}  {:<title_width$}  {:>10}  CWD",
        "ID", "TITLE", "CREATED"
    );
    println!("{}", "-".repeat(id_width + title_width + 20));

    for session in sessions {
        println!(
            "{:<id_width$}  {:<title_width$}  {:>10}  {}",
            session.id,
            truncate_str(&session.title, title_width),
            format_relative_time(session.created_at, now),
            session.cwd,
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a timestamp relative to `now` (e.g., "5m ago").
fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - timestamp).num_seconds().max(0);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if cut.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC, then wait for its socket to go away.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect_daemon().await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));

    match client.stop().await.context("Failed to send stop request")? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() && !is_daemon_running() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon with SIGKILL using the PID file.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid().context("No running daemon found (PID file missing or stale)")?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    // The daemon cannot clean up after SIGKILL.
    let _ = std::fs::remove_file(daemon::ipc::get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
