//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence; the file only fills in what the command
//! line left unset.

use crate::health;
use crate::server::ServerOptions;
use clap::Parser;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(version)]
#[command(about = "A multi-threaded TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Number of worker threads driving the reactor
    #[arg(short = 't', long = "thread")]
    pub thread: Option<usize>,

    /// TCP port the server binds to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (IP literal)
    #[arg(long)]
    pub host: Option<String>,

    /// Read config from a TOML file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory to write logs to
    #[arg(short = 'l', long = "log")]
    pub log: Option<PathBuf>,

    /// Enable debug-level logging
    #[arg(short, long)]
    pub debug: bool,
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
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Number of worker threads
    pub threads: Option<usize>,
    /// Maximum number of tracked connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Interval between connection health checks
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// How long shutdown waits for pending work
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            threads: None,
            max_connections: default_max_connections(),
            health_interval_ms: default_health_interval_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log directory
    pub dir: Option<PathBuf>,
    /// Enable debug-level logging
    #[serde(default)]
    pub debug: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_threads() -> usize {
    12
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./serverlog")
}

fn default_max_connections() -> usize {
    10_000
}

fn default_health_interval_ms() -> u64 {
    health::DEFAULT_INTERVAL.as_millis() as u64
}

fn default_drain_timeout_secs() -> u64 {
    30
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub threads: usize,
    pub max_connections: usize,
    pub health_interval: Duration,
    pub drain_timeout: Duration,
    pub log_dir: PathBuf,
    pub debug: bool,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    /// Load configuration from explicit arguments (first is the program name).
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = CliArgs::try_parse_from(args).map_err(ConfigError::Cli)?;

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

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli.port.or(file.server.port).ok_or(ConfigError::MissingPort)?;
        if file.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be at least 1"));
        }
        if file.server.health_interval_ms == 0 {
            return Err(ConfigError::Invalid("server.health_interval_ms must be at least 1"));
        }

        Ok(Config {
            host: cli
                .host
                .or(file.server.host)
                .unwrap_or_else(default_host),
            port,
            threads: cli
                .thread
                .or(file.server.threads)
                .unwrap_or_else(default_threads),
            max_connections: file.server.max_connections,
            health_interval: Duration::from_millis(file.server.health_interval_ms),
            drain_timeout: Duration::from_secs(file.server.drain_timeout_secs),
            log_dir: cli.log.or(file.logging.dir).unwrap_or_else(default_log_dir),
            debug: cli.debug || file.logging.debug,
        })
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_connections: self.max_connections,
            health_interval: self.health_interval,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Cli(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Cli(e) => write!(f, "{}", e),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingPort => {
                write!(f, "No port given: pass --port or set server.port in the config file")
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
