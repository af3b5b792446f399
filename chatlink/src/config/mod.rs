//! Configuration system for the `chatlink` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{
    ConnectionConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DEDUP_CAPACITY,
    DEFAULT_INACTIVITY_TIMEOUT,
};

/// Backend used when nothing else is configured.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:9000/ws";

/// Upper bound on any configured timeout (one day).
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Errors that can occur when loading configuration.
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

    /// A timeout is zero or longer than [`MAX_TIMEOUT_SECS`].
    #[error("invalid {field}: {secs}s (expected 1..={max}s)", max = MAX_TIMEOUT_SECS)]
    InvalidTimeout {
        /// Config key that was rejected.
        field: &'static str,
        /// The configured value.
        secs: u64,
    },

    /// The server URL is not a usable WebSocket URL.
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    storage: StorageFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    inactivity_timeout_secs: Option<u64>,
    ack_timeout_secs: Option<u64>,
    dedup_capacity: Option<usize>,
    channel_capacity: Option<usize>,
    event_buffer: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    state_path: Option<PathBuf>,
    identity_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Backend WebSocket URL (`ws://` or `wss://`).
    pub server_url: String,
    /// Timeout for opening the connection.
    pub connect_timeout: Duration,

    // -- Session --
    /// Time without a backend ping before the session is closed.
    pub inactivity_timeout: Duration,
    /// Time allowed for a `confirm` after a send.
    pub ack_timeout: Duration,
    /// Number of processed frame keys remembered for dedup.
    pub dedup_capacity: usize,
    /// Channel capacity for the connection command channel.
    pub channel_capacity: usize,
    /// Buffer size for the connection event channel.
    pub event_buffer: usize,

    // -- Storage --
    /// Conversation snapshot file; `None` keeps state in memory only.
    pub state_path: Option<PathBuf>,
    /// Client id file; `None` uses a fresh id per run.
    pub identity_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            channel_capacity: 256,
            event_buffer: 64,
            state_path: None,
            identity_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and silently ignored if
    /// missing. Storage paths fall back to the user's data directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// a timeout is out of range, or the resolved server URL is not a
    /// WebSocket URL.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let mut config = Self::resolve(cli, &file)?;
        if config.state_path.is_none() {
            config.state_path = crate::store::FileStateStore::default_path();
        }
        if config.identity_path.is_none() {
            config.identity_path = crate::session::SessionIdentity::default_path();
        }
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server_url = cli
            .server_url
            .clone()
            .or_else(|| file.server.url.clone())
            .unwrap_or(defaults.server_url);
        validate_server_url(&server_url)?;

        Ok(Self {
            server_url,
            connect_timeout: timeout_secs(
                "connect_timeout_secs",
                file.server.connect_timeout_secs,
                defaults.connect_timeout,
            )?,
            inactivity_timeout: timeout_secs(
                "inactivity_timeout_secs",
                file.session.inactivity_timeout_secs,
                defaults.inactivity_timeout,
            )?,
            ack_timeout: timeout_secs(
                "ack_timeout_secs",
                file.session.ack_timeout_secs,
                defaults.ack_timeout,
            )?,
            dedup_capacity: file
                .session
                .dedup_capacity
                .unwrap_or(defaults.dedup_capacity),
            channel_capacity: file
                .session
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            event_buffer: file.session.event_buffer.unwrap_or(defaults.event_buffer),
            state_path: cli
                .state_path
                .clone()
                .or_else(|| file.storage.state_path.clone()),
            identity_path: cli
                .identity_path
                .clone()
                .or_else(|| file.storage.identity_path.clone()),
        })
    }

    /// Timers and buffer sizes for the connection task.
    #[must_use]
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            inactivity_timeout: self.inactivity_timeout,
            ack_timeout: self.ack_timeout,
            dedup_capacity: self.dedup_capacity,
            channel_capacity: self.channel_capacity,
            event_buffer: self.event_buffer,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Line-mode chat client")]
pub struct CliArgs {
    /// WebSocket URL of the chat backend.
    #[arg(long, env = "CHATLINK_SERVER_URL")]
    pub server_url: Option<String>,

    /// Path to config file (default: `~/.config/chatlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Conversation snapshot file.
    #[arg(long, env = "CHATLINK_STATE_PATH")]
    pub state_path: Option<PathBuf>,

    /// Client id file.
    #[arg(long, env = "CHATLINK_IDENTITY_PATH")]
    pub identity_path: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINK_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatlink.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Convert a configured timeout, rejecting 0 and values above
/// [`MAX_TIMEOUT_SECS`].
fn timeout_secs(
    field: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(secs @ 1..=MAX_TIMEOUT_SECS) => Ok(Duration::from_secs(secs)),
        Some(secs) => Err(ConfigError::InvalidTimeout { field, secs }),
    }
}

/// Check that `url` parses and uses `ws` or `wss`.
fn validate_server_url(url: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other:?}, expected ws or wss"),
        }),
    }
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("chatlink").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
