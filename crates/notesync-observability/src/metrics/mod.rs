//! 指标收集模块
//!
//! 提供基于 metrics 库的指标收集功能。

use metrics::{describe_counter, describe_gauge, Unit};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::Result;
#[cfg(feature = "prometheus")]
use crate::error::ObservabilityError;

/// Connections accepted since start
pub const CONNECTIONS_TOTAL: &str = "notesync_ws_connections_total";
/// Connections currently open
pub const CONNECTIONS_ACTIVE: &str = "notesync_ws_connections_active";
/// Inbound messages, labelled by op
pub const MESSAGES_TOTAL: &str = "notesync_ws_messages_total";
/// Rejected handshakes and messages, labelled by reason
pub const REJECTED_TOTAL: &str = "notesync_ws_rejected_total";
/// Frames that could not be queued for a connection
pub const SEND_FAILURES_TOTAL: &str = "notesync_ws_send_failures_total";

/// 指标收集器
pub struct MetricsCollector {
    #[cfg(feature = "prometheus")]
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// 创建指标收集器; `install_recorder` installs the global Prometheus recorder
    pub fn new(install_recorder: bool) -> Result<Self> {
        #[cfg(feature = "prometheus")]
        let handle = if install_recorder {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|e| {
                ObservabilityError::metrics(format!("Failed to set global recorder: {}", e))
            })?;
            Some(handle)
        } else {
            None
        };
        #[cfg(not(feature = "prometheus"))]
        let _ = install_recorder;

        register_descriptions();

        tracing::info!(
            target: "notesync_observability",
            "Metrics collector initialized"
        );

        Ok(Self {
            #[cfg(feature = "prometheus")]
            handle,
        })
    }

    /// 获取 Prometheus 格式的指标
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

fn register_descriptions() {
    describe_counter!(CONNECTIONS_TOTAL, Unit::Count, "Total number of accepted connections");
    describe_gauge!(CONNECTIONS_ACTIVE, Unit::Count, "Number of open connections");
    describe_counter!(MESSAGES_TOTAL, Unit::Count, "Total number of inbound messages");
    describe_counter!(REJECTED_TOTAL, Unit::Count, "Total number of rejected handshakes and messages");
    describe_counter!(SEND_FAILURES_TOTAL, Unit::Count, "Total number of failed frame deliveries");
}

/// Gateway 指标记录器
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// 记录连接建立
    pub fn connection_opened() {
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    }

    /// 记录连接关闭
    pub fn connection_closed() {
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    }

    /// 记录一条入站消息
    pub fn message_received(op: &'static str) {
        metrics::counter!(MESSAGES_TOTAL, "op" => op).increment(1);
    }

    /// 记录一次拒绝
    pub fn rejected(reason: &'static str) {
        metrics::counter!(REJECTED_TOTAL, "reason" => reason).increment(1);
    }

    /// 记录投递失败
    pub fn send_failed() {
        metrics::counter!(SEND_FAILURES_TOTAL).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_without_recorder() {
        let collector = MetricsCollector::new(false).unwrap();
        assert!(collector.render().is_empty());
        GatewayMetrics::connection_opened();
        GatewayMetrics::message_received("PING");
        GatewayMetrics::rejected("origin");
        GatewayMetrics::connection_closed();
    }
}
