//! ptygate
//!
//! Terminal session gateway: serves PTY-backed shells to browser terminal
//! views over WebSocket, with a local admin CLI.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, is_daemon_running, IpcClient, IpcResponse,
    PidFile,
};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::session::SessionInfo;
use nix::sys::signal::Signal;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Timeout for CLI requests to the daemon.
const IPC_TIMEOUT: Duration = Duration::from_secs(5);

/// ptygate - terminal session gateway.
#[derive(Parser, Debug)]
#[command(name = "ptygate")]
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

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the gateway in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
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

    /// Kill a live session
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Signal to send, by name (SIGTERM, TERM) or number (15)
        #[arg(long, short, default_value = "SIGTERM")]
        signal: String,

        /// Force kill (equivalent to --signal SIGKILL)
        #[arg(long, short)]
        force: bool,
    },

    /// Kill every session held by one owner
    KillOwner {
        /// Owner (user) ID
        owner_id: String,
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
    config.validate().context("Invalid configuration")?;

    let _log_guard = init_tracing(cli.verbose, &config)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Start => run_daemon(config).await,
        Commands::Stop { force, timeout } => {
            if force {
                force_stop_daemon()?;
                println!("Daemon forcefully terminated");
            } else {
                graceful_stop_daemon(timeout)
                    .await
                    .context("Failed to stop daemon (try: ptygate stop --force)")?;
                println!("Daemon stopped successfully");
            }
            Ok(())
        }
        Commands::Status => {
            let mut client = connect().await?;
            match client.status().await? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    session_count,
                    connection_count,
                    bind_addr,
                    protocol_version,
                } => {
                    println!("Daemon Status: {}", if running { "running" } else { "stopped" });
                    if let Some(pid) = get_daemon_pid() {
                        println!("  PID:         {}", pid);
                    }
                    println!("  Listening:   ws://{}", bind_addr);
                    println!("  Protocol:    v{}", protocol_version);
                    println!("  Uptime:      {}", format_duration(uptime_secs));
                    println!("  Sessions:    {}", session_count);
                    println!("  Connections: {}", connection_count);
                    Ok(())
                }
                IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
                _ => anyhow::bail!("Unexpected response from daemon"),
            }
        }
        Commands::Sessions(SessionsCommands::List { json }) => {
            let sessions = connect().await?.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
            Ok(())
        }
        Commands::Sessions(SessionsCommands::Kill {
            session_id,
            signal,
            force,
        }) => {
            let signal = if force { "SIGKILL".to_string() } else { signal };
            let signal_num = parse_signal(&signal)?;

            match connect().await?.kill_session(session_id.clone(), Some(signal_num)).await? {
                IpcResponse::SessionKilled { .. } => {
                    println!("Session {} terminated with {} ({})", session_id, signal, signal_num);
                    Ok(())
                }
                IpcResponse::Error { message } => anyhow::bail!("{}", message),
                _ => anyhow::bail!("Unexpected response from daemon"),
            }
        }
        Commands::Sessions(SessionsCommands::KillOwner { owner_id }) => {
            match connect().await?.kill_owner_sessions(owner_id.clone()).await? {
                IpcResponse::SessionsKilled { count } => {
                    println!("Killed {} session(s) owned by {}", count, owner_id);
                    Ok(())
                }
                IpcResponse::Error { message } => anyhow::bail!("{}", message),
                _ => anyhow::bail!("Unexpected response from daemon"),
            }
        }
    }
}

/// Initializes logging to stderr, plus a daily rolling file when
/// `daemon.log_dir` is set.
///
/// `RUST_LOG` takes precedence over `--verbose` and the configured level.
fn init_tracing(verbose: bool, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.daemon.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ptygate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), IPC_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("Daemon is not running (cannot connect to socket): {}", e))
}

/// Runs the daemon until SIGTERM, SIGINT or an IPC stop request.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    if is_daemon_running() {
        let pid = get_daemon_pid().unwrap_or(0);
        anyhow::bail!(
            "Daemon already running (PID: {}). Stop it with: ptygate stop",
            pid
        );
    }
    let _pid_file = PidFile::create(get_pid_file_path()).context("Failed to write PID file")?;

    let mut orchestrator = DaemonOrchestrator::new(config)?;
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
                OrchestratorEvent::Session(_) | OrchestratorEvent::StopRequested => {}
            }
        }
    });

    orchestrator.start().await?;
    if let Some(addr) = orchestrator.local_addr() {
        tracing::info!("ptygate listening on ws://{}", addr);
    }

    let stop_requested = orchestrator.stop_requested();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = stop_requested.cancelled() => tracing::info!("Stop requested by client"),
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

/// Gracefully stop the daemon via IPC, then wait for its socket to go away.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if !socket_path.exists()
            || IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon with SIGKILL and remove what it leaves behind.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid = get_daemon_pid().context("Daemon is not running (no live PID file)")?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());
    Ok(())
}

/// Parse a signal string into a signal number.
///
/// Accepts numbers ("9") and names with or without the prefix, in any case
/// ("SIGTERM", "term").
fn parse_signal(signal_str: &str) -> anyhow::Result<i32> {
    if let Ok(num) = signal_str.parse::<i32>() {
        return Signal::try_from(num)
            .map(|signal| signal as i32)
            .map_err(|_| anyhow::anyhow!("Invalid signal number: {}", num));
    }

    let name = signal_str.to_uppercase();
    let name = if name.starts_with("SIG") { name } else { format!("SIG{}", name) };
    name.parse::<Signal>()
        .map(|signal| signal as i32)
        .map_err(|_| anyhow::anyhow!("Unknown signal: {}", signal_str))
}

/// Print sessions in a formatted ASCII table.
/// Formats a byte count with a binary unit suffix.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}

fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No live sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(0).clamp(8, 36);
    let owner_width = sessions
        .iter()
        .map(|s| s.owner_id.len())
        .max()
        .unwrap_or(0)
        .clamp(5, 24);

    println!(
        "{:<id_width$}  {:<owner_width$}  {:>8}  {:>7}  {:<10}  {:>8}  {:>10}  {:>4}  {:>9}",
        "ID", "OWNER", "PID", "SIZE", "STATE", "IDLE", "CREATED", "SUBS", "SENT",
    );
    println!("{}", "-".repeat(id_width + owner_width + 76));

    for session in sessions {
        let pid = session
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let sent: u64 = session.subscribers.iter().map(|s| s.bytes_delivered).sum();
        println!(
            "{:<id_width$}  {:<owner_width$}  {:>8}  {:>7}  {:<10}  {:>8}  {:>10}  {:>4}  {:>9}",
            truncate_str(&session.id, id_width),
            truncate_str(&session.owner_id, owner_width),
            pid,
            format!("{}x{}", session.cols, session.rows),
            session.state.to_string(),
            format_duration(session.idle_secs),
            format_relative_time(session.created_at),
            session.subscribers.len(),
            format_bytes(sent),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);
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
