//! Configuration module for the pixelflood server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::framebuffer::MAX_DIMENSION;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the pixelflood server
#[derive(Parser, Debug)]
#[command(name = "pixelflood")]
#[command(author = "pixelflood authors")]
#[command(version = "0.1.0")]
#[command(about = "A pixel flood server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Framebuffer width in pixels
    #[arg(short = 'W', long)]
    pub width: Option<u32>,

    /// Framebuffer height in pixels
    #[arg(short = 'H', long)]
    pub height: Option<u32>,

    /// Longest accepted command line in bytes; longer lines close the connection
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Maximum number of concurrent connections. Each connection holds two
    /// file descriptors, so keep this below half of the open-file limit
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub framebuffer: FramebufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Connection limit; each connection uses two file descriptors
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Framebuffer dimensions
#[derive(Debug, Deserialize)]
pub struct FramebufferConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
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
    "0.0.0.0:1234".to_string()
}

fn default_width() -> u32 {
    1024
}

fn default_height() -> u32 {
    768
}

fn default_max_connections() -> usize {
    500
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub width: u32,
    pub height: u32,
    pub max_line_length: usize,
    pub max_connections: usize,
    pub workers: Option<usize>,
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

        let config = Self::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: Option<CliArgs>, toml_config: TomlConfig) -> Self {
        let Some(cli) = cli else {
            return Config {
                listen: toml_config.server.listen,
                width: toml_config.framebuffer.width,
                height: toml_config.framebuffer.height,
                max_line_length: toml_config.server.max_line_length,
                max_connections: toml_config.server.max_connections,
                workers: toml_config.server.workers,
                log_level: toml_config.logging.level,
            };
        };

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            width: cli.width.unwrap_or(toml_config.framebuffer.width),
            height: cli.height.unwrap_or(toml_config.framebuffer.height),
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.server.max_line_length),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.width > MAX_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "width must be between 1 and {}, got {}",
                MAX_DIMENSION, self.width
            )));
        }
        if self.height == 0 || self.height > MAX_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "height must be between 1 and {}, got {}",
                MAX_DIMENSION, self.height
            )));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "max_line_length must be greater than 0".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:1234");
        assert_eq!(config.width, 1024);
        assert_eq!(config.height, 768);
        assert_eq!(config.max_line_length, 64 * 1024);
        assert_eq!(config.max_connections, 500);
        assert_eq!(config.workers, None);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:1337"
            workers = 4
            max_connections = 500
            max_line_length = 256

            [framebuffer]
            width = 1920
            height = 1080

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:1337");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 500);
        assert_eq!(config.server.max_line_length, 256);
        assert_eq!(config.framebuffer.width, 1920);
        assert_eq!(config.framebuffer.height, 1080);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:1337"

            [framebuffer]
            width = 800
            height = 600

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from(["pixelflood", "--width", "320", "--log-level", "trace"]);
        let config = Config::merge(Some(cli), toml_config);

        assert_eq!(config.listen, "127.0.0.1:1337");
        assert_eq!(config.width, 320);
        assert_eq!(config.height, 600);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.width = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.height = MAX_DIMENSION + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_line_length = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workers = Some(0);
        assert!(config.validate().is_err());
    }
}
