//! Server configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Server configuration loaded from a TOML file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server name, used for thread and connection naming
    #[serde(default = "default_name")]
    pub name: String,

    /// Address to listen on
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// Set SO_REUSEPORT so several instances can share the port
    #[serde(default)]
    pub reuse_port: bool,

    /// Worker thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Per-connection tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            address: default_address(),
            reuse_port: false,
            workers: WorkersConfig::default(),
            connection: ConnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of IO loop threads (default: number of CPUs)
    pub threads: Option<usize>,
}

/// Per-connection tuning.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Seconds of silence before a connection is force-closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Output-buffer size that triggers the high-water callback
    /// (e.g. "64MB", "512KB")
    #[serde(
        default = "default_high_water_mark",
        deserialize_with = "deserialize_size"
    )]
    pub high_water_mark: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            idle_timeout_secs: default_idle_timeout_secs(),
            high_water_mark: default_high_water_mark(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Log destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    /// Formatted lines to stderr
    #[default]
    Console,
    /// Formatted lines appended to `logging.path`
    File,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Level filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log lines
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include thread names in log lines
    #[serde(default = "default_true")]
    pub thread_names: bool,

    #[serde(default)]
    pub sink: LogSink,

    /// Log file path (required for the file sink)
    pub path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
            sink: LogSink::default(),
            path: None,
        }
    }
}

// Default value functions

fn default_name() -> String {
    "reactor".to_string()
}

fn default_address() -> SocketAddr {
    "0.0.0.0:9006".parse().unwrap()
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_high_water_mark() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Deserialize a size string like "64MB" or a plain byte count.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB", "4GB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connection.idle_timeout_secs == 0 {
            return Err("idle_timeout_secs must be positive".into());
        }
        if self.logging.sink == LogSink::File && self.logging.path.is_none() {
            return Err("logging.path is required for the file sink".into());
        }
        Ok(())
    }

    /// Number of IO loop threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }

    /// Server options derived from this configuration.
    pub fn server_options(&self) -> reactor_net::ServerOptions {
        reactor_net::ServerOptions {
            reuse_port: self.reuse_port,
            threads: self.threads(),
            idle_timeout: Duration::from_secs(self.connection.idle_timeout_secs),
            high_water_mark: self.connection.high_water_mark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert!(parse_size("4XB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str(r#"address = "127.0.0.1:8080""#).unwrap();
        config.validate().unwrap();
        assert_eq!(config.address, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.name, "reactor");
        assert_eq!(config.connection.idle_timeout_secs, 60);
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            name = "edge"
            address = "0.0.0.0:8080"
            reuse_port = true

            [workers]
            threads = 4

            [connection]
            idle_timeout_secs = 30
            high_water_mark = "16MB"

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            sink = "console"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.threads(), 4);
        assert_eq!(config.connection.high_water_mark, 16 * 1024 * 1024);
        assert_eq!(config.logging.format, LogFormat::Json);

        let options = config.server_options();
        assert!(options.reuse_port);
        assert_eq!(options.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }

    #[test]
    fn test_file_sink_requires_path() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            sink = "file"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
