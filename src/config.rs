//! Configuration module for digest-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::digest::{Digester, DEFAULT_ALGORITHM};
use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the benchmark
#[derive(Parser, Debug)]
#[command(name = "digest-bench")]
#[command(author = "digest-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP throughput benchmark with digest echo verification", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Digest algorithm (sha1, sha256); both peers must agree
    #[arg(long, global = true)]
    pub digest: Option<String>,

    /// Seconds between statistics reports
    #[arg(long, global = true)]
    pub report_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Send random payloads to a server and verify the echoed digests
    Client {
        /// Server host name or address
        host: Option<String>,

        /// Server port
        port: Option<u16>,

        /// Payloads sent per second
        rate: Option<u32>,

        /// Payload size in bytes; must match the server
        #[arg(long)]
        payload_size: Option<usize>,
    },
    /// Accept clients and answer every payload with its digest
    Server {
        /// Port to listen on
        port: Option<u16>,

        /// Address to bind to
        #[arg(short = 'l', long)]
        bind: Option<String>,

        /// Payload size in bytes; must match the clients
        #[arg(long)]
        payload_size: Option<usize>,

        /// Responses that may be outstanding per connection before reads pause
        #[arg(short = 'q', long)]
        queue_capacity: Option<usize>,

        /// Maximum number of simultaneous clients
        #[arg(long)]
        max_connections: Option<usize>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub digest: DigestSection,
    #[serde(default)]
    pub report: ReportSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            rate: default_rate(),
            payload_size: default_payload_size(),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            payload_size: default_payload_size(),
            queue_capacity: default_queue_capacity(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DigestSection {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl Default for DigestSection {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
        }
    }
}

/// Reporting configuration. The interval defaults per role.
#[derive(Debug, Deserialize, Default)]
pub struct ReportSection {
    pub interval_secs: Option<u64>,
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
    "127.0.0.1".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_rate() -> u32 {
    100
}

fn default_payload_size() -> usize {
    8192
}

fn default_queue_capacity() -> usize {
    10
}

fn default_max_connections() -> usize {
    1024
}

fn default_algorithm() -> String {
    DEFAULT_ALGORITHM.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const CLIENT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
const SERVER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Settings for the client role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Payloads per second, always > 0.
    pub rate: u32,
    pub payload_size: usize,
}

impl ClientConfig {
    /// Minimum spacing between payload generations.
    pub fn send_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.rate.max(1)))
    }
}

/// Settings for the server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub payload_size: usize,
    pub queue_capacity: usize,
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Client(ClientConfig),
    Server(ServerConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub digest: Digester,
    pub report_interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let (role, default_interval) = match cli.role {
            RoleArgs::Client {
                host,
                port,
                rate,
                payload_size,
            } => {
                let section = toml_config.client;
                let client = ClientConfig {
                    host: host.unwrap_or(section.host),
                    port: port.unwrap_or(section.port),
                    rate: rate.unwrap_or(section.rate),
                    payload_size: payload_size.unwrap_or(section.payload_size),
                };
                (Role::Client(client), CLIENT_REPORT_INTERVAL)
            }
            RoleArgs::Server {
                port,
                bind,
                payload_size,
                queue_capacity,
                max_connections,
            } => {
                let section = toml_config.server;
                let server = ServerConfig {
                    bind: bind.unwrap_or(section.bind),
                    port: port.unwrap_or(section.port),
                    payload_size: payload_size.unwrap_or(section.payload_size),
                    queue_capacity: queue_capacity.unwrap_or(section.queue_capacity),
                    max_connections: max_connections.unwrap_or(section.max_connections),
                };
                (Role::Server(server), SERVER_REPORT_INTERVAL)
            }
        };

        let report_interval = cli
            .report_interval
            .or(toml_config.report.interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(default_interval);

        let config = Config {
            role,
            digest: Digester::new(cli.digest.unwrap_or(toml_config.digest.algorithm)),
            report_interval,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        match &self.role {
            Role::Client(client) => {
                if client.rate == 0 {
                    return Err(invalid("rate", "must be at least 1 payload per second"));
                }
                if client.payload_size == 0 {
                    return Err(invalid("payload_size", "must be greater than 0"));
                }
            }
            Role::Server(server) => {
                if server.payload_size == 0 {
                    return Err(invalid("payload_size", "must be greater than 0"));
                }
                if server.queue_capacity == 0 {
                    return Err(invalid("queue_capacity", "must be greater than 0"));
                }
                if server.max_connections == 0 {
                    return Err(invalid("max_connections", "must be greater than 0"));
                }
            }
        }

        if self.report_interval.is_zero() {
            return Err(invalid("report interval", "must be greater than 0"));
        }

        self.digest
            .output_len()
            .map_err(|e| invalid("digest", &e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("digest-bench").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.client.host, "127.0.0.1");
        assert_eq!(config.client.rate, 100);
        assert_eq!(config.server.payload_size, 8192);
        assert_eq!(config.server.queue_capacity, 10);
        assert_eq!(config.digest.algorithm, "sha1");
        assert_eq!(config.report.interval_secs, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [client]
            host = "10.0.0.5"
            port = 7000
            rate = 250

            [server]
            bind = "127.0.0.1"
            port = 7000
            queue_capacity = 4

            [digest]
            algorithm = "sha256"

            [report]
            interval_secs = 1

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.host, "10.0.0.5");
        assert_eq!(config.client.port, 7000);
        assert_eq!(config.client.rate, 250);
        assert_eq!(config.client.payload_size, 8192);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.queue_capacity, 4);
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.digest.algorithm, "sha256");
        assert_eq!(config.report.interval_secs, Some(1));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_client_positional_args() {
        let config = Config::resolve(cli(&["client", "example.org", "9100", "50"]), TomlConfig::default())
            .unwrap();
        assert_eq!(
            config.role,
            Role::Client(ClientConfig {
                host: "example.org".to_string(),
                port: 9100,
                rate: 50,
                payload_size: 8192,
            })
        );
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.digest.algorithm(), "sha1");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            queue_capacity = 3

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            cli(&["server", "7100", "--bind", "127.0.0.1", "--log-level", "trace"]),
            toml_config,
        )
        .unwrap();

        let Role::Server(server) = &config.role else {
            panic!("expected server role");
        };
        assert_eq!(server.listen_addr(), "127.0.0.1:7100");
        assert_eq!(server.queue_capacity, 3);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.report_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_toml_log_level_used_when_cli_default() {
        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let config = Config::resolve(cli(&["server"]), toml_config).unwrap();
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_send_interval() {
        let client = ClientConfig {
            host: default_host(),
            port: 1,
            rate: 4,
            payload_size: 8,
        };
        assert_eq!(client.send_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_zero_rate() {
        let err = Config::resolve(cli(&["client", "localhost", "9000", "0"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "rate", .. }));
    }

    #[test]
    fn test_rejects_zero_queue_capacity() {
        let err = Config::resolve(cli(&["server", "--queue-capacity", "0"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue_capacity", .. }));
    }

    #[test]
    fn test_rejects_unknown_digest() {
        let err = Config::resolve(cli(&["--digest", "md5", "server"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "digest", .. }));
    }
}
