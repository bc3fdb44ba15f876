//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。未安装 recorder 时记录函数为空操作。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!(
        "eventhub_events_published_total",
        "Total number of events published to EventHub"
    );
    metrics::describe_counter!(
        "eventhub_published_bytes_total",
        "Total payload bytes published to EventHub"
    );
    metrics::describe_counter!(
        "eventhub_events_received_total",
        "Total number of events received from EventHub"
    );
    metrics::describe_histogram!(
        "eventhub_handler_duration_seconds",
        "Event handler duration in seconds"
    );
    metrics::describe_counter!("orders_processed_total", "Total number of orders processed");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "指标服务已监听");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "指标服务异常退出");
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一次发布结果
#[inline]
pub fn record_event_published(channel: &str, success: bool, bytes: usize) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(
        "eventhub_events_published_total",
        "channel" => channel.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        metrics::counter!(
            "eventhub_published_bytes_total",
            "channel" => channel.to_string()
        )
        .increment(bytes as u64);
    }
}

/// 记录收到的事件
#[inline]
pub fn record_event_received(consumer_group: &str, partition: i32) {
    metrics::counter!(
        "eventhub_events_received_total",
        "consumer_group" => consumer_group.to_string(),
        "partition" => partition.to_string()
    )
    .increment(1);
}

/// 记录 handler 耗时
#[inline]
pub fn record_handler_duration(consumer_group: &str, duration_secs: f64) {
    metrics::histogram!(
        "eventhub_handler_duration_seconds",
        "consumer_group" => consumer_group.to_string()
    )
    .record(duration_secs);
}

/// 记录订单处理结果（processed / decode_failed / persist_failed）
#[inline]
pub fn record_order_processed(service: &str, status: &str) {
    metrics::counter!(
        "orders_processed_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
