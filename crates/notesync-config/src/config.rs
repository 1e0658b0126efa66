use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_bool(value: &str) -> ConfigResult<bool> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid boolean: {}", value)))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

impl Config {
    /// Read a value by dotted key, e.g. `gateway.bind`
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["gateway", "bind"] => Some(self.gateway.bind.clone()),
            ["gateway", "allowed_origins"] => Some(self.gateway.allowed_origins.join(",")),
            ["gateway", "anonymous_allowed"] => Some(self.gateway.anonymous_allowed.to_string()),
            ["gateway", "collaborative_mode"] => Some(self.gateway.collaborative_mode.to_string()),
            ["gateway", "paragraph_status_progress"] => {
                Some(self.gateway.paragraph_status_progress.to_string())
            }
            ["gateway", "max_connections"] => Some(self.gateway.max_connections.to_string()),
            ["gateway", "heartbeat_interval_secs"] => {
                Some(self.gateway.heartbeat_interval_secs.to_string())
            }
            ["gateway", "worker_pool_size"] => Some(self.gateway.worker_pool_size.to_string()),
            ["gateway", "watcher_key"] => self.gateway.watcher_key.clone(),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "file"] => self.logging.file.clone(),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            _ => None,
        }
    }

    /// Set a value by dotted key
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["gateway", "bind"] => {
                self.gateway.bind = value.to_string();
            }
            ["gateway", "allowed_origins"] => {
                self.gateway.allowed_origins = value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            ["gateway", "anonymous_allowed"] => {
                self.gateway.anonymous_allowed = parse_bool(value)?;
            }
            ["gateway", "collaborative_mode"] => {
                self.gateway.collaborative_mode = parse_bool(value)?;
            }
            ["gateway", "paragraph_status_progress"] => {
                self.gateway.paragraph_status_progress = parse_bool(value)?;
            }
            ["gateway", "max_connections"] => {
                self.gateway.max_connections = parse_number(value)?;
            }
            ["gateway", "heartbeat_interval_secs"] => {
                self.gateway.heartbeat_interval_secs = parse_number(value)?;
            }
            ["gateway", "worker_pool_size"] => {
                self.gateway.worker_pool_size = parse_number(value)?;
            }
            ["gateway", "watcher_key"] => {
                self.gateway.watcher_key = Some(value.to_string());
            }
            ["logging", "level"] => {
                self.logging.level = value.parse()?;
            }
            ["logging", "file"] => {
                self.logging.file = Some(value.to_string());
            }
            ["logging", "json_format"] => {
                self.logging.json_format = parse_bool(value)?;
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

/// WebSocket gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address (e.g., "127.0.0.1:18790")
    pub bind: String,
    /// Origins allowed to open a connection; `*` allows any
    pub allowed_origins: Vec<String>,
    /// Accept messages from the `anonymous` principal
    pub anonymous_allowed: bool,
    /// Enables incremental paragraph patches and collaborator announcements
    pub collaborative_mode: bool,
    /// Forward streamed output and progress events to clients
    pub paragraph_status_progress: bool,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Heartbeat ping interval in seconds; 0 disables pings
    pub heartbeat_interval_secs: u64,
    /// Size of the background execution pool
    pub worker_pool_size: usize,
    /// Secret a connection must present to switch to watcher mode
    pub watcher_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
            allowed_origins: vec!["*".to_string()],
            anonymous_allowed: true,
            collaborative_mode: true,
            paragraph_status_progress: true,
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            worker_pool_size: 10,
            watcher_key: None,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Log file; stdout only when unset
    pub file: Option<String>,
    pub json_format: bool,
    /// Per-module overrides, e.g. `notesync_gateway::fanout = "debug"`
    pub module_levels: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
            json_format: false,
            module_levels: HashMap::new(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert_eq!(config.gateway.worker_pool_size, 10);
        assert!(config.gateway.anonymous_allowed);
        assert_eq!(config.gateway.allowed_origins, vec!["*".to_string()]);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"gateway": {"anonymous_allowed": false}}"#).unwrap();
        assert!(!config.gateway.anonymous_allowed);
        assert_eq!(config.gateway.max_connections, 1000);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_get_and_set_value() {
        let mut config = Config::default();
        config
            .set_value("gateway.allowed_origins", "http://a.com, http://b.com")
            .unwrap();
        assert_eq!(
            config.get_value("gateway.allowed_origins").as_deref(),
            Some("http://a.com,http://b.com")
        );

        config.set_value("logging.level", "WARNING").unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);

        assert!(config.set_value("gateway.max_connections", "lots").is_err());
        assert!(matches!(
            config.set_value("gateway.nope", "1"),
            Err(ConfigError::KeyNotFound(_))
        ));
        assert!(config.get_value("gateway.watcher_key").is_none());
    }

    #[test]
    fn test_gateway_config_toml_shape() {
        let toml = toml::to_string(&GatewayConfig::default()).unwrap();
        assert!(toml.contains("bind = \"127.0.0.1:18790\""));
        assert!(toml.contains("worker_pool_size = 10"));
    }
}
