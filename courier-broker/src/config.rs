//! Configuration for the Courier broker.
//!
//! Priority (highest first): CLI arguments, environment variables (via clap
//! `env`), the TOML file at `~/.config/courier-broker/config.toml`, then
//! compiled defaults.

use std::path::PathBuf;

use crate::store::DEFAULT_MAX_HISTORY;

/// Errors that can occur when loading broker configuration.
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

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_history: Option<usize>,
}

/// CLI arguments for the broker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier pub/sub broker")]
pub struct BrokerCliArgs {
    /// Address to bind the broker to.
    #[arg(short, long, env = "COURIER_BROKER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/courier-broker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Records kept per conversation before the oldest is evicted.
    #[arg(long)]
    pub max_history: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_BROKER_LOG")]
    pub log_level: String,
}

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind, e.g. `0.0.0.0:9000`.
    pub bind_addr: String,
    /// Records kept per conversation.
    pub max_history: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_history: DEFAULT_MAX_HISTORY,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// An explicit `--config` path must exist. The default path may be
    /// absent, in which case defaults apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    fn resolve(cli: &BrokerCliArgs, file: &BrokerConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_history: cli
                .max_history
                .or(file.server.max_history)
                .unwrap_or(defaults.max_history),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BrokerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(BrokerConfigFile::default());
        };
        config_dir.join("courier-broker").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
