//! Configuration system for the `courier` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use courier_proto::message::UserId;

use crate::facade::CourierConfig;
use crate::net::ReconnectConfig;

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

    /// A required setting was not given anywhere.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A URL setting does not parse or has the wrong scheme.
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        /// Which setting.
        field: &'static str,
        /// The offending value.
        value: String,
        /// What is wrong with it.
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
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    broker_url: Option<String>,
    history_url: Option<String>,
    user_id: Option<String>,
    peer_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    history_timeout_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    /// Zero disables the timeout.
    confirm_timeout_secs: Option<u64>,
    route_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    // -- Network --
    /// Broker WebSocket URL.
    pub broker_url: String,
    /// Base URL of the history endpoint.
    pub history_url: String,
    /// Local user id.
    pub user_id: Option<String>,
    /// Peer to talk to.
    pub peer_id: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the broker's `connected` reply.
    pub handshake_timeout: Duration,
    /// Timeout for one history request.
    pub history_timeout: Duration,

    // -- Reconnect --
    /// Backoff schedule.
    pub reconnect: ReconnectConfig,

    // -- Chat --
    /// Fail messages not echoed within this window.
    pub confirm_timeout: Option<Duration>,
    /// Inbound channel capacity per conversation.
    pub route_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let courier = CourierConfig::default();
        Self {
            broker_url: "ws://127.0.0.1:9000/ws".to_string(),
            history_url: "http://127.0.0.1:9000".to_string(),
            user_id: None,
            peer_id: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            history_timeout: Duration::from_secs(10),
            reconnect: courier.reconnect,
            confirm_timeout: courier.confirm_timeout,
            route_buffer: courier.route_buffer,
        }
    }
}

/// Who talks to whom, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Validated broker WebSocket URL.
    pub broker_url: Url,
    /// Validated history base URL.
    pub history_url: Url,
    /// Local user.
    pub user: UserId,
    /// The other participant.
    pub peer: UserId,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/courier/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let net = &file.network;
        let rc = &file.reconnect;

        Self {
            broker_url: cli
                .broker_url
                .clone()
                .or_else(|| net.broker_url.clone())
                .unwrap_or(defaults.broker_url),
            history_url: cli
                .history_url
                .clone()
                .or_else(|| net.history_url.clone())
                .unwrap_or(defaults.history_url),
            user_id: cli.user.clone().or_else(|| net.user_id.clone()),
            peer_id: cli.peer.clone().or_else(|| net.peer_id.clone()),
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: net
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            history_timeout: net
                .history_timeout_secs
                .map_or(defaults.history_timeout, Duration::from_secs),
            reconnect: ReconnectConfig {
                initial_delay: rc
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: rc
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                multiplier: rc.multiplier.unwrap_or(defaults.reconnect.multiplier),
                jitter: rc.jitter.unwrap_or(defaults.reconnect.jitter),
            },
            confirm_timeout: cli
                .confirm_timeout_secs
                .or(file.chat.confirm_timeout_secs)
                .map_or(defaults.confirm_timeout, |secs| {
                    (secs > 0).then(|| Duration::from_secs(secs))
                }),
            route_buffer: file.chat.route_buffer.unwrap_or(defaults.route_buffer),
        }
    }

    /// The facade settings carried by this configuration.
    #[must_use]
    pub fn courier_config(&self) -> CourierConfig {
        CourierConfig {
            reconnect: self.reconnect.clone(),
            route_buffer: self.route_buffer,
            confirm_timeout: self.confirm_timeout,
        }
    }

    /// Validate the connection settings and participants.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if the user or peer is not set,
    /// [`ConfigError::InvalidUrl`] if a URL does not parse or has the
    /// wrong scheme.
    pub fn session(&self) -> Result<SessionConfig, ConfigError> {
        let user = non_empty(self.user_id.as_deref()).ok_or(ConfigError::Missing("user"))?;
        let peer = non_empty(self.peer_id.as_deref()).ok_or(ConfigError::Missing("peer"))?;
        Ok(SessionConfig {
            broker_url: parse_url("broker_url", &self.broker_url, &["ws", "wss"])?,
            history_url: parse_url("history_url", &self.history_url, &["http", "https"])?,
            user: UserId::new(user),
            peer: UserId::new(peer),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
            reason: format!("expected scheme {}", schemes.join(" or ")),
        });
    }
    Ok(url)
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Line-mode chat client with optimistic delivery")]
pub struct CliArgs {
    /// Broker WebSocket URL.
    #[arg(long, env = "COURIER_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Base URL of the history endpoint.
    #[arg(long, env = "COURIER_HISTORY_URL")]
    pub history_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "COURIER_USER")]
    pub user: Option<String>,

    /// User id of the person to chat with.
    #[arg(long, env = "COURIER_PEER")]
    pub peer: Option<String>,

    /// Fail messages not confirmed within this many seconds (0 disables).
    #[arg(long)]
    pub confirm_timeout_secs: Option<u64>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courier.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("courier").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
