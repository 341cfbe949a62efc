//! Configuration module for the echo-device server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::device::{DeviceConfig, DeviceNode, DEFAULT_CAPACITY};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Connection runtime selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness-based worker threads (epoll/kqueue)
    #[default]
    Mio,
    /// Tokio multi-threaded async runtime
    Tokio,
}

/// Command-line arguments for the echo-device server
#[derive(Parser, Debug)]
#[command(name = "echo-device")]
#[command(author = "echo-device authors")]
#[command(version = "0.1.0")]
#[command(about = "A single shared echo buffer served over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7007)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connection runtime
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Maximum concurrent connections (per worker for mio)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum message length held by the device, in bytes
    #[arg(short = 'b', long)]
    pub capacity: Option<usize>,

    /// Device node name
    #[arg(short = 'n', long)]
    pub name: Option<String>,

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
    pub device: DeviceSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub workers: usize,
    /// Connection runtime
    #[serde(default)]
    pub runtime: RuntimeType,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest WRITE payload accepted from a client
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Device-related configuration
#[derive(Debug, Deserialize)]
pub struct DeviceSection {
    /// Node name
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Maximum message length in bytes
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Owning user id
    #[serde(default)]
    pub owner: u32,
    /// Owning group id
    #[serde(default)]
    pub group: u32,
    /// Permission bits as an octal string, e.g. "0600"
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            capacity: default_capacity(),
            owner: 0,
            group: 0,
            mode: default_mode(),
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
    "127.0.0.1:7007".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_request_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_device_name() -> String {
    "echo".to_string()
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_mode() -> String {
    "0600".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse permission bits written in octal ("600", "0600", "0o600").
pub fn parse_mode(mode: &str) -> Result<u32, ConfigError> {
    let digits = mode.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);

    match u32::from_str_radix(digits, 8) {
        Ok(bits) if bits <= 0o7777 => Ok(bits),
        _ => Err(ConfigError::InvalidMode(mode.to_string())),
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub runtime: RuntimeType,
    pub max_connections: usize,
    pub max_request_size: usize,
    pub device: DeviceConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
            max_request_size: default_max_request_size(),
            device: DeviceConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let node = DeviceNode {
            name: cli.name.unwrap_or(toml_config.device.name),
            owner: toml_config.device.owner,
            group: toml_config.device.group,
            mode: parse_mode(&toml_config.device.mode)?,
        };

        Ok(Config {
            listen,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_request_size: toml_config.server.max_request_size,
            device: DeviceConfig {
                node,
                capacity: cli.capacity.unwrap_or(toml_config.device.capacity),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    InvalidMode(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
            ConfigError::InvalidMode(mode) => {
                write!(f, "Invalid device mode '{mode}': expected octal permission bits")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
