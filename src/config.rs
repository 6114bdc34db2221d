//! Configuration module for the eotb-echo server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Highest valid TCP port.
pub const MAX_PORT: i64 = 65535;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "eotb-echo")]
#[command(author = "eotb-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "An EOTB-framed TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (0-65535)
    #[arg(short, long, allow_negative_numbers = true)]
    pub port: Option<i64>,

    /// Message that asks the server to close the connection
    #[arg(short = 'k', long)]
    pub termination_keyword: Option<String>,

    /// Largest message a connection may accumulate in bytes (0 = unbounded)
    #[arg(short = 'm', long)]
    pub max_message_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the console client
#[derive(Parser, Debug)]
#[command(name = "eotb-client")]
#[command(version = "0.1.0")]
#[command(about = "Console client for the eotb-echo server", long_about = None)]
pub struct ClientArgs {
    /// Server IPv4 address in dotted-quad form
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port (0-65535)
    #[arg(short, long, default_value_t = 7000, allow_negative_numbers = true)]
    pub port: i64,

    /// Message that ends the session
    #[arg(short = 'k', long, default_value = "quit")]
    pub termination_keyword: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: i64,
    /// Readiness events collected per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Framing-related configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_termination_keyword")]
    pub termination_keyword: String,
    /// Size of the transfer buffer used for each socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Cap on a single accumulated message, 0 disables the cap
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            termination_keyword: default_termination_keyword(),
            read_buffer_size: default_read_buffer_size(),
            max_message_size: default_max_message_size(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> i64 {
    7000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_termination_keyword() -> String {
    "quit".to_string()
}

fn default_read_buffer_size() -> usize {
    512
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub events_capacity: usize,
    pub termination_keyword: String,
    pub read_buffer_size: usize,
    pub max_message_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 7000,
            events_capacity: default_events_capacity(),
            termination_keyword: default_termination_keyword(),
            read_buffer_size: default_read_buffer_size(),
            max_message_size: default_max_message_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge already-parsed CLI args with the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = validate_port(cli.port.unwrap_or(toml_config.server.port))?;

        let termination_keyword = cli
            .termination_keyword
            .unwrap_or(toml_config.protocol.termination_keyword);
        if termination_keyword.trim().is_empty() {
            return Err(ConfigError::EmptyKeyword);
        }

        if toml_config.protocol.read_buffer_size == 0 {
            return Err(ConfigError::ZeroReadBuffer);
        }

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            events_capacity: toml_config.server.events_capacity.max(1),
            termination_keyword,
            read_buffer_size: toml_config.protocol.read_buffer_size,
            max_message_size: cli
                .max_message_size
                .unwrap_or(toml_config.protocol.max_message_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Check that `port` lies in 0-65535.
pub fn validate_port(port: i64) -> Result<u16, ConfigError> {
    if !(0..=MAX_PORT).contains(&port) {
        return Err(ConfigError::InvalidPort(port));
    }
    Ok(port as u16)
}

/// Check that `host` is a dotted-quad IPv4 address.
pub fn validate_ipv4(host: &str) -> Result<Ipv4Addr, ConfigError> {
    host.parse()
        .map_err(|_| ConfigError::InvalidAddress(host.to_string()))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(i64),
    InvalidAddress(String),
    EmptyKeyword,
    ZeroReadBuffer,
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
            ConfigError::InvalidPort(port) => {
                write!(f, "The port must be a number between 0 and 65535, got {port}")
            }
            ConfigError::InvalidAddress(host) => {
                write!(f, "Invalid IPv4 address '{host}'")
            }
            ConfigError::EmptyKeyword => write!(f, "Termination keyword must not be empty"),
            ConfigError::ZeroReadBuffer => write!(f, "Read buffer size must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
