//! Configuration for the tcpgate server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. Everything is
//! validated once, up front, and reported as a [`ConfigError`].

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::message::DEFAULT_MAX_FRAME_SIZE;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "tcpgate")]
#[command(version = "0.1.0")]
#[command(about = "A framed TCP connection server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to
    #[arg(long)]
    pub ip: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Server name used in logs
    #[arg(short, long)]
    pub name: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ManagerConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            name: default_name(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_name() -> String {
    "server001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// Cosmetic name used in logs.
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: default_port(),
            name: default_name(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        Ok(())
    }
}

/// Connection manager settings. Timeouts are whole seconds; 0 disables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum live connections (0 = unlimited)
    pub max_connections: usize,
    /// Budget for a connection to be registered after accept
    pub connection_timeout: u64,
    /// Advisory; not enforced by the pumps
    pub transmission_timeout: u64,
    /// Interval between health sweeps
    pub exploration_cycle: u64,
    /// Idle time after which a health probe fails
    pub detection_timeout: u64,
    /// Rolling deadline for reads and writes; overrides the two below
    pub readwrite_timeout: u64,
    pub read_timeout: u64,
    pub write_timeout: u64,
    /// Initial read buffer size in bytes
    pub read_buffer: usize,
    /// Write buffer size in bytes
    pub write_buffer: usize,
    /// Largest accepted frame body in bytes
    pub max_frame_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            connection_timeout: 2,
            transmission_timeout: 2,
            exploration_cycle: 15,
            detection_timeout: 30,
            readwrite_timeout: 0,
            read_timeout: 6,
            write_timeout: 1,
            read_buffer: 1024,
            write_buffer: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections > i32::MAX as usize {
            return Err(ConfigError::invalid(
                "max_connections",
                format!("must be at most {}", i32::MAX),
            ));
        }
        if self.exploration_cycle == 0 {
            return Err(ConfigError::invalid("exploration_cycle", "must be positive"));
        }
        if self.read_buffer == 0 {
            return Err(ConfigError::invalid("read_buffer", "must be positive"));
        }
        if self.write_buffer == 0 {
            return Err(ConfigError::invalid("write_buffer", "must be positive"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > i32::MAX as usize {
            return Err(ConfigError::invalid(
                "max_frame_size",
                format!("must be between 1 and {}", i32::MAX),
            ));
        }
        Ok(())
    }

    /// Look up a timeout option in seconds by name. Unknown names return 0.
    pub fn timeout_option(&self, name: &str) -> u64 {
        match name {
            "connection_timeout" => self.connection_timeout,
            "transmission_timeout" => self.transmission_timeout,
            "exploration_cycle" => self.exploration_cycle,
            "detection_timeout" => self.detection_timeout,
            "readwrite_timeout" => self.readwrite_timeout,
            "read_timeout" => self.read_timeout,
            "write_timeout" => self.write_timeout,
            _ => 0,
        }
    }

    /// [`timeout_option`](Self::timeout_option) as a `Duration`.
    pub fn timeout(&self, name: &str) -> Duration {
        Duration::from_secs(self.timeout_option(name))
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub manager: ManagerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };
        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over the TOML config (CLI takes precedence) and validate.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let ip_str = cli.ip.unwrap_or(toml_config.server.ip);
        let ip = ip_str
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::invalid("ip", format!("'{ip_str}' is not an IP address")))?;

        let server = ServerConfig {
            ip,
            port: cli.port.unwrap_or(toml_config.server.port),
            name: cli.name.unwrap_or(toml_config.server.name),
        };

        let mut manager = toml_config.connection;
        if let Some(max) = cli.max_connections {
            manager.max_connections = max;
        }

        server.validate()?;
        manager.validate()?;

        Ok(Config {
            server,
            manager,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("tcpgate").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = Config::resolve(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.manager, ManagerConfig::default());
        assert_eq!(config.manager.max_connections, 10_000);
        assert_eq!(config.manager.read_timeout, 6);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            ip = "0.0.0.0"
            port = 9000
            name = "chat"

            [connection]
            max_connections = 50
            detection_timeout = 10
            read_buffer = 4096

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::resolve(cli(&[]), parsed).unwrap();
        assert_eq!(config.server.ip, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.name, "chat");
        assert_eq!(config.manager.max_connections, 50);
        assert_eq!(config.manager.detection_timeout, 10);
        assert_eq!(config.manager.read_buffer, 4096);
        // Unset fields keep their defaults.
        assert_eq!(config.manager.exploration_cycle, 15);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let parsed: TomlConfig = toml::from_str("[server]\nport = 9000\n").unwrap();
        let config =
            Config::resolve(cli(&["--port", "7000", "-m", "3", "--log-level", "warn"]), parsed)
                .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.manager.max_connections, 3);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = Config::resolve(cli(&["--ip", "not-an-ip"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { option: "ip", .. }));

        let err = Config::resolve(cli(&["--name", " "]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { option: "name", .. }));

        let parsed: TomlConfig = toml::from_str("[connection]\nexploration_cycle = 0\n").unwrap();
        let err = Config::resolve(cli(&[]), parsed).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                option: "exploration_cycle",
                ..
            }
        ));

        assert!(toml::from_str::<TomlConfig>("[connection]\nread_timeout = -1\n").is_err());
    }

    #[test]
    fn test_timeout_option_lookup() {
        let config = ManagerConfig::default();
        assert_eq!(config.timeout_option("detection_timeout"), 30);
        assert_eq!(config.timeout_option("write_timeout"), 1);
        assert_eq!(config.timeout_option("no_such_option"), 0);
        assert_eq!(config.timeout("read_timeout"), Duration::from_secs(6));
    }
}
