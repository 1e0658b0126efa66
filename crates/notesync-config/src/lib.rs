pub mod config;
pub mod manager;

pub use config::{Config, ConfigError, ConfigResult, GatewayConfig, LogLevel, LoggingConfig};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// Base directory for notesync state (`~/.notesync`)
pub fn notesync_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".notesync"))
}

/// Default config file path
pub fn default_config_path() -> Option<PathBuf> {
    notesync_dir().map(|dir| dir.join("config.json"))
}

/// Default log file path
pub fn default_log_path() -> Option<PathBuf> {
    notesync_dir().map(|dir| dir.join("logs").join("notesync.log"))
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notesync_dir() {
        let dir = notesync_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().to_string_lossy().contains(".notesync"));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/.notesync/config.json");
        assert!(expanded.is_some());
        assert!(!expanded.unwrap().to_string_lossy().starts_with('~'));
        assert_eq!(expand_tilde("/tmp/a").unwrap(), PathBuf::from("/tmp/a"));
    }
}
