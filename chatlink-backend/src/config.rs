//! Configuration system for the `chatlink` backend.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatlink-backend/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::{DEFAULT_PING_INTERVAL, DEFAULT_REPLY_DELAY, SessionSettings};

/// Errors that can occur when loading backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the backend.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackendConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
}

/// `[server]` section of the backend config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
}

/// `[session]` section of the backend config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    ping_interval_secs: Option<u64>,
    reply_delay_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the backend.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "chatlink reference backend")]
pub struct BackendCliArgs {
    /// Address to bind the backend to.
    #[arg(short, long, env = "CHATLINK_BACKEND_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/chatlink-backend/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds between pings to each session (0 disables pings).
    #[arg(long)]
    pub ping_interval_secs: Option<u64>,

    /// Milliseconds to wait before replying to a message.
    #[arg(long)]
    pub reply_delay_ms: Option<u64>,

    /// Close sessions that send no message for this many seconds (0 never).
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINK_BACKEND_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Interval between pings; `None` disables them.
    pub ping_interval: Option<Duration>,
    /// Pause before each reply.
    pub reply_delay: Duration,
    /// Idle session timeout; `None` keeps sessions open.
    pub idle_timeout: Option<Duration>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            reply_delay: DEFAULT_REPLY_DELAY,
            idle_timeout: None,
            log_level: "info".to_string(),
        }
    }
}

impl BackendConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &BackendCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `BackendConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. A zero interval or timeout disables
    /// that behaviour.
    #[must_use]
    fn resolve(cli: &BackendCliArgs, file: &BackendConfigFile) -> Self {
        let defaults = Self::default();

        let ping_interval = match cli
            .ping_interval_secs
            .or(file.session.ping_interval_secs)
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.ping_interval,
        };
        let idle_timeout = match cli.idle_timeout_secs.or(file.session.idle_timeout_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.idle_timeout,
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            ping_interval,
            reply_delay: cli
                .reply_delay_ms
                .or(file.session.reply_delay_ms)
                .map_or(defaults.reply_delay, Duration::from_millis),
            idle_timeout,
            log_level: cli.log_level.clone(),
        }
    }

    /// Session timing for [`crate::backend::BackendState::with_settings`].
    #[must_use]
    pub const fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ping_interval: self.ping_interval,
            reply_delay: self.reply_delay,
            idle_timeout: self.idle_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the backend.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BackendConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(BackendConfigFile::default());
        };
        config_dir.join("chatlink-backend").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackendConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
