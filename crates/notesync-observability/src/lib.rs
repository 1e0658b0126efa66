//! Observability for the notesync gateway
//!
//! 提供统一的日志和指标功能。

#![warn(missing_docs)]

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{ObservabilityError, Result};
pub use logging::LogManager;
pub use metrics::{GatewayMetrics, MetricsCollector};

use std::sync::Arc;

use notesync_config::Config;
use parking_lot::RwLock;

/// 统一的观测性句柄
#[derive(Debug)]
pub struct Observability {
    log_manager: Arc<RwLock<LogManager>>,
    metrics: Arc<MetricsCollector>,
}

impl Observability {
    /// 初始化日志与指标
    pub async fn init(config: &Config) -> Result<Self> {
        let log_manager = Arc::new(RwLock::new(LogManager::new(&config.logging).await?));
        let metrics = Arc::new(MetricsCollector::new(true)?);

        tracing::info!(
            target: "notesync_observability",
            "Observability infrastructure initialized"
        );

        Ok(Self {
            log_manager,
            metrics,
        })
    }

    /// 获取日志管理器
    pub fn log_manager(&self) -> Arc<RwLock<LogManager>> {
        Arc::clone(&self.log_manager)
    }

    /// 获取指标收集器
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }
}
