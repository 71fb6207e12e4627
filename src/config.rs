//! Configuration module for the beamline TCP server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backends::image::MAX_FRAMES;
use crate::framer::DEFAULT_MAX_LINE_LENGTH;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "beamline-tcp")]
#[command(version)]
#[command(about = "Line-oriented TCP command server for beamline instruments", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port (e.g. 10001) or address and port (e.g. 127.0.0.1:10001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Backend command set to serve
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Base directory for image paths
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Number of display frames opened at startup
    #[arg(long)]
    pub frames: Option<usize>,

    /// Serve connections concurrently or one at a time
    #[arg(long, value_enum)]
    pub mode: Option<SessionMode>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Upper-cased echo of each command
    #[default]
    Echo,
    /// Image display frames with regions and count limits
    Image,
    /// Pixel detector acquisition
    Detector,
}

/// How accepted connections are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One task per connection
    #[default]
    Threaded,
    /// One connection at a time
    Serial,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: TomlServerConfig,
    #[serde(default)]
    pub backend: TomlBackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct TomlServerConfig {
    /// Port or address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub mode: SessionMode,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Grace period for in-flight sessions on shutdown
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TomlServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: SessionMode::default(),
            workers: None,
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
            backlog: default_backlog(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Backend-related configuration
#[derive(Debug, Deserialize)]
pub struct TomlBackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_initial_frames")]
    pub initial_frames: usize,
}

impl Default for TomlBackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_dir: default_base_dir(),
            initial_frames: default_initial_frames(),
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
    "0.0.0.0:10000".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_backlog() -> i32 {
    128
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./")
}

fn default_initial_frames() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub mode: SessionMode,
    pub max_connections: usize,
    pub max_line_length: usize,
    pub backlog: i32,
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 10000)),
            mode: SessionMode::default(),
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
            backlog: default_backlog(),
            drain_timeout: Duration::from_millis(default_drain_timeout_ms()),
        }
    }
}

/// Resolved backend settings
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_dir: PathBuf,
    pub initial_frames: usize,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file named by `--config`, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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
        let server = toml_config.server;
        let listen = parse_listen(cli.listen.as_deref().unwrap_or(&server.listen))?;
        let initial_frames = cli.frames.unwrap_or(toml_config.backend.initial_frames);
        if initial_frames > MAX_FRAMES {
            return Err(ConfigError::InvalidFrames(initial_frames));
        }

        Ok(Config {
            server: ServerConfig {
                listen,
                mode: cli.mode.unwrap_or(server.mode),
                max_connections: server.max_connections.max(1),
                max_line_length: server.max_line_length,
                backlog: server.backlog,
                drain_timeout: Duration::from_millis(server.drain_timeout_ms),
            },
            backend: BackendConfig {
                kind: cli.backend.unwrap_or(toml_config.backend.kind),
                base_dir: cli.base_dir.unwrap_or(toml_config.backend.base_dir),
                initial_frames,
            },
            workers: cli.workers.or(server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Parse `PORT` or `HOST:PORT`.
///
/// A bare port binds on all interfaces. Host names are resolved and the
/// first address wins.
pub fn parse_listen(value: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidListen(value.to_string());

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let port: u16 = value.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let valid_host = !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
    if !valid_host {
        return Err(invalid());
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}': expected PORT or HOST:PORT")]
    InvalidListen(String),
    #[error("Invalid frame count {}: at most {} frames", .0, MAX_FRAMES)]
    InvalidFrames(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("beamline-tcp").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:10000");
        assert_eq!(config.server.mode, SessionMode::Threaded);
        assert_eq!(config.server.max_line_length, 4096);
        assert_eq!(config.backend.kind, BackendKind::Echo);
        assert_eq!(config.backend.initial_frames, 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:10001"
            mode = "serial"
            workers = 4
            drain_timeout_ms = 250

            [backend]
            kind = "image"
            base_dir = "/data/pilatus"
            initial_frames = 2

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:10001");
        assert_eq!(config.server.mode, SessionMode::Serial);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.drain_timeout_ms, 250);
        assert_eq!(config.backend.kind, BackendKind::Image);
        assert_eq!(config.backend.base_dir, PathBuf::from("/data/pilatus"));
        assert_eq!(config.backend.initial_frames, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:10001"
            [backend]
            kind = "image"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--listen", "10002", "--backend", "detector", "--mode", "serial"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:10002".parse().unwrap());
        assert_eq!(config.server.mode, SessionMode::Serial);
        assert_eq!(config.backend.kind, BackendKind::Detector);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_frame_count_bounded() {
        let config = Config::merge(cli(&["--frames", "64"]), TomlConfig::default()).unwrap();
        assert_eq!(config.backend.initial_frames, MAX_FRAMES);

        assert!(matches!(
            Config::merge(cli(&["--frames", "65"]), TomlConfig::default()),
            Err(ConfigError::InvalidFrames(65))
        ));

        let toml_config: TomlConfig = toml::from_str("[backend]\ninitial_frames = 100").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), toml_config),
            Err(ConfigError::InvalidFrames(100))
        ));
    }

    #[test]
    fn test_parse_listen() {
        assert_eq!(
            parse_listen("10001").unwrap(),
            "0.0.0.0:10001".parse().unwrap()
        );
        assert_eq!(
            parse_listen("127.0.0.1:10001").unwrap(),
            "127.0.0.1:10001".parse().unwrap()
        );
        assert!(parse_listen("localhost:10001").is_ok());
    }

    #[test]
    fn test_parse_listen_rejects_garbage() {
        for bad in ["", "99999", "host", ":10001", "127.0.0.1:", "a b:1", "127.0.0.1:port"] {
            assert!(
                matches!(parse_listen(bad), Err(ConfigError::InvalidListen(_))),
                "{bad} should be rejected"
            );
        }
    }
}
