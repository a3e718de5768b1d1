//! Configuration module for the framewire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// What happens to a connection after its response is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Close after one request/response cycle.
    #[default]
    SingleShot,
    /// Keep the connection open and wait for the next request.
    Persistent,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "framewire")]
#[command(author = "framewire authors")]
#[command(version = "0.1.0")]
#[command(about = "An event-driven server for length-prefixed JSON-header frames", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:65000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Connection mode: close after one response, or keep serving
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<ConnectionMode>,

    /// Largest accepted payload in bytes
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Poll timeout in milliseconds (0 = block until an event arrives)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub mode: ConnectionMode,
    /// Capacity of the readiness event batch
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// 0 blocks until an event arrives
    #[serde(default)]
    pub poll_timeout_ms: u64,
    /// Upper bound on bytes taken by a single read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            mode: ConnectionMode::default(),
            events_capacity: default_events_capacity(),
            poll_timeout_ms: 0,
            read_chunk_size: default_read_chunk_size(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:65000".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub mode: ConnectionMode,
    pub events_capacity: usize,
    pub poll_timeout: Option<Duration>,
    pub read_chunk_size: usize,
    pub max_payload_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(None, TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the optional config file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: Option<CliArgs>, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        let poll_timeout_ms = cli
            .as_ref()
            .and_then(|c| c.poll_timeout_ms)
            .unwrap_or(server.poll_timeout_ms);

        let mut config = Config {
            listen: server.listen,
            backlog: server.backlog,
            mode: server.mode,
            events_capacity: server.events_capacity,
            poll_timeout: (poll_timeout_ms > 0).then(|| Duration::from_millis(poll_timeout_ms)),
            read_chunk_size: server.read_chunk_size,
            max_payload_size: server.max_payload_size,
            log_level: toml_config.logging.level,
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        if let Some(cli) = cli {
            if let Some(listen) = cli.listen {
                config.listen = listen;
            }
            if let Some(mode) = cli.mode {
                config.mode = mode;
            }
            if let Some(max_payload_size) = cli.max_payload_size {
                config.max_payload_size = max_payload_size;
            }
            if cli.log_level != "info" {
                config.log_level = cli.log_level;
            }
        }
        config
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("events_capacity must be positive".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be positive".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:65000");
        assert_eq!(config.server.mode, ConnectionMode::SingleShot);
        assert_eq!(config.server.read_chunk_size, 4096);
        assert_eq!(config.logging.level, "info");

        let resolved = Config::default();
        assert_eq!(resolved.poll_timeout, None);
        assert_eq!(resolved.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            backlog = 64
            mode = "persistent"
            events_capacity = 256
            poll_timeout_ms = 250
            read_chunk_size = 1024
            max_payload_size = 65536

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.mode, ConnectionMode::Persistent);
        assert_eq!(config.server.events_capacity, 256);
        assert_eq!(config.server.poll_timeout_ms, 250);
        assert_eq!(config.server.read_chunk_size, 1024);
        assert_eq!(config.server.max_payload_size, 65536);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result: Result<TomlConfig, _> = toml::from_str("[server]\nmode = \"forever\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nlisten = \"127.0.0.1:7001\"\nmode = \"persistent\"\npoll_timeout_ms = 50\n\n[logging]\nlevel = \"warn\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = CliArgs::parse_from([
            "framewire",
            "--config",
            path.as_str(),
            "--listen",
            "127.0.0.1:7002",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7002");
        assert_eq!(config.mode, ConnectionMode::Persistent);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(50)));
        assert_eq!(config.log_level, "warn");

        let cli = CliArgs::parse_from([
            "framewire",
            "--config",
            path.as_str(),
            "--mode",
            "single-shot",
            "--log-level",
            "trace",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7001");
        assert_eq!(config.mode, ConnectionMode::SingleShot);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_missing_file_and_invalid_values() {
        let cli = CliArgs::parse_from(["framewire", "--config", "/nonexistent/framewire.toml"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nread_chunk_size = 0").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = CliArgs::parse_from(["framewire", "--config", path.as_str()]);
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));
    }
}
