//! Configuration management for the ptygate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptygate/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_sessions_per_owner must be between 1 and max_sessions ({max}), got {value}")]
    InvalidMaxSessionsPerOwner { value: usize, max: usize },

    #[error("output_queue_capacity must be greater than 0, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("subscriber_send_timeout_ms must be greater than 0, got {0}")]
    InvalidSendTimeout(u64),

    #[error("reap_interval_secs must be greater than 0, got {0}")]
    InvalidReapInterval(u64),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("max_message_size must be greater than 0, got {0}")]
    InvalidMaxMessageSize(usize),

    #[error("bind_addr must be a socket address like 127.0.0.1:7681, got {0}")]
    InvalidBindAddr(String),

    #[error("identity_header is not a valid HTTP header name: {0}")]
    InvalidIdentityHeader(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("default_cwd is not a directory: {0}")]
    InvalidDefaultCwd(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ptygate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket gateway configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (pid file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// WebSocket gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    pub bind_addr: String,

    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,

    /// Handshake header carrying the authenticated user id, set by the
    /// identity layer in front of the gateway. Not enforced when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_header: Option<String>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Working directory when a `create` omits `cwd`. Home directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<PathBuf>,

    /// Extra environment variables for every shell.
    pub env: BTreeMap<String, String>,

    /// Terminal width when a `create` omits `cols`.
    pub default_cols: u16,

    /// Terminal height when a `create` omits `rows`.
    pub default_rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Maximum number of concurrent sessions per owner.
    pub max_sessions_per_owner: usize,

    /// Kill sessions idle for this long, in seconds (0 = never).
    pub idle_timeout_secs: u64,

    /// How often the idle reaper runs, in seconds.
    pub reap_interval_secs: u64,

    /// Per-subscriber output queue capacity, in chunks of at most 4 KiB.
    pub output_queue_capacity: usize,

    /// How long a full subscriber may stall its session before eviction.
    pub subscriber_send_timeout_ms: u64,

    /// How long a shell may survive a catchable kill signal before it is
    /// sent `SIGKILL`, in milliseconds.
    pub kill_grace_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7681".to_string(),
            max_message_size: 1024 * 1024,
            identity_header: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cwd: None,
            env: BTreeMap::new(),
            default_cols: protocol::DEFAULT_COLS,
            default_rows: protocol::DEFAULT_ROWS,
            max_sessions: 64,
            max_sessions_per_owner: 8,
            idle_timeout_secs: 3600,
            reap_interval_secs: 30,
            output_queue_capacity: 256,
            subscriber_send_timeout_ms: 5000,
            kill_grace_ms: 2000,
        }
    }
}

impl SessionConfig {
    /// Shell to spawn, `None` to fall back to `$SHELL`.
    pub fn shell(&self) -> Option<String> {
        if self.default_shell.is_empty() {
            None
        } else {
            Some(self.default_shell.clone())
        }
    }

    /// Working directory for sessions that do not name one.
    pub fn cwd(&self) -> PathBuf {
        self.default_cwd
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Idle timeout, `None` when reaping is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Interval between reaper passes.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    /// Eviction timeout for full subscribers.
    pub fn subscriber_send_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_send_timeout_ms)
    }

    /// Delay before a catchable kill is escalated to `SIGKILL`.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptygate")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptygate")
}

/// Returns the default shell.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Whether `name` is a syntactically valid HTTP header name.
fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYGATE_BIND_ADDR: Override the gateway listen address
    /// - PTYGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PTYGATE_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("PTYGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.max_sessions_per_owner < 1 || session.max_sessions_per_owner > session.max_sessions
        {
            return Err(ConfigError::InvalidMaxSessionsPerOwner {
                value: session.max_sessions_per_owner,
                max: session.max_sessions,
            });
        }

        if session.output_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(session.output_queue_capacity));
        }

        if session.subscriber_send_timeout_ms == 0 {
            return Err(ConfigError::InvalidSendTimeout(session.subscriber_send_timeout_ms));
        }

        if session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval(session.reap_interval_secs));
        }

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: session.default_cols,
                rows: session.default_rows,
            });
        }

        if !session.default_shell.is_empty() {
            let shell_path = Path::new(&session.default_shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(&session.default_shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
            }
        }

        if let Some(cwd) = &session.default_cwd {
            if !cwd.is_dir() {
                return Err(ConfigError::InvalidDefaultCwd(cwd.display().to_string()));
            }
        }

        if self.server.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize(self.server.max_message_size));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        if let Some(header) = &self.server.identity_header {
            if !is_header_name(header) {
                return Err(ConfigError::InvalidIdentityHeader(header.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
