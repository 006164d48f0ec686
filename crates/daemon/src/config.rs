//! Configuration management for the PaneHub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/panehub/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::PasswordHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("bind_addr must be a socket address like 127.0.0.1:3000, got {0}")]
    InvalidBindAddr(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("{0} must not be empty")]
    EmptyCommand(&'static str),

    #[error("token_ttl_secs must be between 60 and 2592000 seconds, got {0}")]
    InvalidTokenTtl(u64),

    #[error("observer_queue must be between 16 and 65536, got {0}")]
    InvalidObserverQueue(usize),

    #[error("password_hash is not a valid hash: {0}")]
    InvalidPasswordHash(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default address the relay listens on.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Default command for agent sessions.
pub const DEFAULT_AGENT_COMMAND: &str = "claude";

const MIN_TOKEN_TTL_SECS: u64 = 60;
const MAX_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const MIN_OBSERVER_QUEUE: usize = 16;
const MAX_OBSERVER_QUEUE: usize = 65536;

/// Main configuration structure for the PaneHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Network-related configuration.
    pub network: NetworkConfig,

    /// Session process configuration.
    pub session: SessionConfig,

    /// Security settings.
    pub security: SecurityConfig,

    /// Observer fan-out settings.
    pub relay: RelayConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (token secret, pid file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file to append logs to instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Network configuration for the relay listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Socket address the websocket relay binds to.
    pub bind_addr: String,
}

/// Session process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used for sessions created without a working directory.
    pub shell: String,

    /// Agent command used for sessions created with a working directory.
    pub agent_command: String,

    /// Extra arguments passed to the agent command.
    pub agent_args: Vec<String>,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Value of TERM in session environments.
    pub term: String,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Password hash checked before issuing tokens (see `hash-password`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,

    /// Lifetime of issued access tokens in seconds.
    pub token_ttl_secs: u64,
}

/// Observer fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Events buffered per observer before it is disconnected as too slow.
    pub observer_queue: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
            agent_args: Vec::new(),
            cols: 120,
            rows: 30,
            term: "xterm-256color".to_string(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            password_hash: None,
            token_ttl_secs: protocol::DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            observer_queue: 1024,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("panehub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("panehub")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PANEHUB_BIND_ADDR: Override relay listen address
    /// - PANEHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PANEHUB_PASSWORD_HASH: Override the login password hash
    /// - PANEHUB_SHELL: Override the plain shell
    /// - PANEHUB_AGENT_COMMAND: Override the agent command
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("PANEHUB_BIND_ADDR") {
            tracing::info!("Overriding bind_addr from environment: {}", addr);
            self.network.bind_addr = addr;
        }

        if let Some(level) = non_empty_env("PANEHUB_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(hash) = non_empty_env("PANEHUB_PASSWORD_HASH") {
            tracing::info!("Overriding password_hash from environment");
            self.security.password_hash = Some(hash);
        }

        if let Some(shell) = non_empty_env("PANEHUB_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.session.shell = shell;
        }

        if let Some(agent) = non_empty_env("PANEHUB_AGENT_COMMAND") {
            tracing::info!("Overriding agent_command from environment: {}", agent);
            self.session.agent_command = agent;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.network.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.network.bind_addr.clone()));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.session.shell.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("shell"));
        }

        if self.session.agent_command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("agent_command"));
        }

        if !(MIN_TOKEN_TTL_SECS..=MAX_TOKEN_TTL_SECS).contains(&self.security.token_ttl_secs) {
            return Err(ConfigError::InvalidTokenTtl(self.security.token_ttl_secs));
        }

        if !(MIN_OBSERVER_QUEUE..=MAX_OBSERVER_QUEUE).contains(&self.relay.observer_queue) {
            return Err(ConfigError::InvalidObserverQueue(self.relay.observer_queue));
        }

        self.password_hash()?;

        Ok(())
    }

    /// Parses the configured password hash, if any.
    pub fn password_hash(&self) -> Result<Option<PasswordHash>, ConfigError> {
        match &self.security.password_hash {
            Some(text) => text
                .parse::<PasswordHash>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidPasswordHash(e.to_string())),
            None => Ok(None),
        }
    }

    /// Returns the parsed relay listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.network.bind_addr.clone()))
    }

    /// Path of the persisted token signing secret.
    pub fn token_secret_path(&self) -> PathBuf {
        self.daemon.data_dir.join("token.key")
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

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
