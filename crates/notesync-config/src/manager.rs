use crate::config::{Config, ConfigError, ConfigResult};
use regex::{Captures, Regex};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 配置管理器
#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<Config>>,
}

impl ConfigManager {
    /// 加载配置文件，不存在时写入默认配置
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!(path = ?path, "loading gateway config");
            read_config(path).await?
        } else {
            info!(path = ?path, "no config file, writing defaults");
            let config = Config::default();
            write_config(path, &config).await?;
            config
        };
        Ok(Self::new(config, path.to_path_buf()))
    }

    /// 从默认位置加载配置
    pub async fn load_default() -> ConfigResult<Self> {
        Self::load(&Self::default_config_path()?).await
    }

    /// 默认配置路径 (~/.notesync/config.json)
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        crate::default_config_path()
            .ok_or_else(|| ConfigError::InvalidPath("Could not find home directory".to_string()))
    }

    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            path,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn get(&self) -> Arc<RwLock<Config>> {
        Arc::clone(&self.config)
    }

    /// Copy of the current configuration
    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 保存配置到文件
    pub async fn save(&self) -> ConfigResult<()> {
        self.save_to(&self.path).await?;
        info!(path = ?self.path, "gateway config saved");
        Ok(())
    }

    /// 保存配置到指定路径
    pub async fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let config = self.snapshot().await;
        write_config(path, &config).await
    }

    /// 重新加载配置; an invalid file leaves the current config in place
    pub async fn reload(&self) -> ConfigResult<()> {
        if !self.path.exists() {
            return Err(ConfigError::InvalidPath(format!(
                "Config file not found: {}",
                self.path.display()
            )));
        }
        let fresh = read_config(&self.path).await?;
        *self.config.write().await = fresh;
        info!(path = ?self.path, "gateway config reloaded");
        Ok(())
    }

    /// 更新配置并保存
    pub async fn update<F>(&self, f: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut Config),
    {
        {
            let mut current = self.config.write().await;
            let mut candidate = current.clone();
            f(&mut candidate);
            Self::validate(&candidate)?;
            *current = candidate;
        }
        self.save().await
    }

    /// 验证配置
    pub fn validate(config: &Config) -> ConfigResult<()> {
        let gateway = &config.gateway;
        let problem = if gateway.bind.parse::<SocketAddr>().is_err() {
            Some(format!("Gateway bind address is invalid: {}", gateway.bind))
        } else if gateway.max_connections == 0 {
            Some("Gateway max_connections must be greater than 0".to_string())
        } else if gateway.worker_pool_size == 0 {
            Some("Gateway worker_pool_size must be greater than 0".to_string())
        } else if gateway.allowed_origins.is_empty() {
            Some("Gateway allowed_origins cannot be empty".to_string())
        } else {
            None
        };
        match problem {
            Some(message) => Err(ConfigError::Validation(message)),
            None => Ok(()),
        }
    }

    /// 展开环境变量 ${VAR} 或 ${VAR:-default}
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let pattern = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        let mut missing = None;
        let expanded = pattern.replace_all(content, |caps: &Captures| {
            let name = &caps[1];
            match (std::env::var(name), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(name) => Err(ConfigError::EnvVarNotFound(name)),
            None => Ok(expanded.into_owned()),
        }
    }
}

async fn read_config(path: &Path) -> ConfigResult<Config> {
    let raw = tokio::fs::read_to_string(path).await?;
    let config: Config = serde_json::from_str(&ConfigManager::expand_env_vars(&raw)?)?;
    ConfigManager::validate(&config)?;
    Ok(config)
}

async fn write_config(path: &Path, config: &Config) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_string_pretty(config)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let manager = ConfigManager::load(&config_path).await.unwrap();
        let config = manager.snapshot().await;

        assert!(config_path.exists());
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert_eq!(config.gateway.worker_pool_size, 10);
    }

    #[tokio::test]
    async fn test_update_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let manager = ConfigManager::load(&config_path).await.unwrap();

        manager
            .update(|config| config.gateway.anonymous_allowed = false)
            .await
            .unwrap();

        let reloaded = ConfigManager::load(&config_path).await.unwrap();
        assert!(!reloaded.snapshot().await.gateway.anonymous_allowed);

        tokio::fs::write(&config_path, r#"{"gateway": {"max_connections": 0}}"#)
            .await
            .unwrap();
        assert!(manager.reload().await.is_err());
        assert!(!manager.snapshot().await.gateway.anonymous_allowed);
    }

    #[tokio::test]
    async fn test_env_var_expansion() {
        std::env::set_var("NOTESYNC_TEST_BIND", "0.0.0.0:9000");

        let content = r#"{"bind": "${NOTESYNC_TEST_BIND}", "key": "${NOTESYNC_UNSET_VAR:-fallback}"}"#;
        let expanded = ConfigManager::expand_env_vars(content).unwrap();

        assert!(expanded.contains("0.0.0.0:9000"));
        assert!(expanded.contains("fallback"));
        assert!(matches!(
            ConfigManager::expand_env_vars("${NOTESYNC_UNSET_VAR}"),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(ConfigManager::validate(&config).is_ok());

        config.gateway.bind = "not-an-address".to_string();
        assert!(ConfigManager::validate(&config).is_err());

        config.gateway.bind = "127.0.0.1:0".to_string();
        config.gateway.worker_pool_size = 0;
        assert!(ConfigManager::validate(&config).is_err());

        config.gateway.worker_pool_size = 4;
        config.gateway.allowed_origins.clear();
        assert!(ConfigManager::validate(&config).is_err());
    }
}
