//! 结构化日志模块
//!
//! 提供基于 tracing 的结构化日志功能。

use std::path::Path;
use std::sync::Arc;

use notesync_config::{expand_tilde, LogLevel, LoggingConfig};
use parking_lot::RwLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::error::{ObservabilityError, Result};

/// 日志级别重新加载句柄类型
type ReloadHandle = Handle<EnvFilter, Registry>;

/// 日志管理器
#[derive(Debug)]
pub struct LogManager {
    config: LoggingConfig,

    /// 过滤器重新加载句柄
    reload_handle: Option<Arc<RwLock<ReloadHandle>>>,

    /// Keeps the file writer flushing until the manager is dropped
    file_guard: Option<WorkerGuard>,

    initialized: bool,
}

impl LogManager {
    /// 创建并安装全局日志订阅者
    pub async fn new(config: &LoggingConfig) -> Result<Self> {
        let mut manager = Self {
            config: config.clone(),
            reload_handle: None,
            file_guard: None,
            initialized: false,
        };

        manager.init().await?;

        Ok(manager)
    }

    async fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let filter = build_filter(&self.config)?;
        let (filter, reload_handle) = reload::Layer::new(filter);

        let file_layer = match self.config.file.as_deref() {
            Some(file) => {
                let path = expand_tilde(file).ok_or_else(|| {
                    ObservabilityError::config(format!("Cannot resolve log file path: {}", file))
                })?;
                let (writer, guard) = file_writer(&path).await?;
                self.file_guard = Some(guard);
                Some(fmt::layer().with_writer(writer).with_ansi(false))
            }
            None => None,
        };

        let (json_layer, text_layer) = if self.config.json_format {
            (Some(fmt::layer().json().with_target(true)), None)
        } else {
            (None, Some(fmt::layer().with_target(true)))
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(text_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| ObservabilityError::logging(format!("Failed to install subscriber: {}", e)))?;

        self.reload_handle = Some(Arc::new(RwLock::new(reload_handle)));
        self.initialized = true;

        tracing::info!(
            target: "notesync_observability",
            "Log manager initialized with level: {}",
            self.config.level.as_str()
        );

        Ok(())
    }

    /// 动态更新日志级别
    pub fn update_level(&mut self, level: LogLevel) -> Result<()> {
        let Some(ref handle) = self.reload_handle else {
            return Err(ObservabilityError::logging("Log manager not initialized"));
        };

        let mut config = self.config.clone();
        config.level = level;
        let new_filter = build_filter(&config)?;

        handle
            .write()
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;

        self.config = config;
        tracing::info!(
            target: "notesync_observability",
            "Log level updated to: {}",
            level.as_str()
        );
        Ok(())
    }

    /// 获取当前配置
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

async fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .ok_or_else(|| ObservabilityError::config(format!("Log file has no directory: {:?}", path)))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| ObservabilityError::config(format!("Log file has no name: {:?}", path)))?;
    tokio::fs::create_dir_all(dir).await?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// 构建环境过滤器: base level plus per-module directives
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(config.level.as_str())
        .map_err(|e| ObservabilityError::logging(format!("Invalid log level: {}", e)))?;

    for (module, level) in &config.module_levels {
        filter = filter.add_directive(
            format!("{}={}", module, level.as_str())
                .parse()
                .map_err(|e| ObservabilityError::logging(format!("Invalid directive: {}", e)))?,
        );
    }

    Ok(filter)
}

/// Span covering the lifetime of one client connection
pub fn connection_span(connection_id: &str, peer: Option<&str>) -> tracing::Span {
    match peer {
        Some(peer) => tracing::info_span!(
            "connection",
            connection_id = %connection_id,
            peer = %peer,
        ),
        None => tracing::info_span!("connection", connection_id = %connection_id),
    }
}

/// Span for work on one note
pub fn note_span(note_id: &str) -> tracing::Span {
    tracing::debug_span!("note", note_id = %note_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_with_modules() {
        let mut config = LoggingConfig::default();
        config
            .module_levels
            .insert("notesync_gateway::fanout".to_string(), LogLevel::Trace);
        let filter = build_filter(&config).unwrap();
        assert!(filter.to_string().contains("notesync_gateway::fanout=trace"));
    }

    #[tokio::test]
    async fn test_log_manager_init_and_update() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = LoggingConfig {
            level: LogLevel::Debug,
            file: Some(temp_dir.path().join("logs").join("gateway.log").to_string_lossy().into_owned()),
            ..Default::default()
        };

        let mut manager = LogManager::new(&config).await.unwrap();
        assert!(temp_dir.path().join("logs").exists());

        tokio_test::assert_ok!(manager.update_level(LogLevel::Warn));
        assert_eq!(manager.config().level, LogLevel::Warn);
    }

    #[test]
    fn test_create_spans() {
        let span = connection_span("c1", Some("127.0.0.1:5000"));
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "connection");
        }
        let _ = note_span("2A94M5J1Z");
    }
}
