//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

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
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
/// 端口绑定失败属于启动期错误，直接返回。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_pipeline_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 描述管道指标，这些描述会出现在 /metrics 端点的 HELP 注释中
fn register_pipeline_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notification_records_total",
        "Records read from the durable log, by outcome"
    );
    metrics::describe_counter!(
        "admission_decisions_total",
        "Admission decisions, by decision"
    );
    metrics::describe_counter!(
        "pool_submissions_total",
        "Tasks submitted to worker pools, by pool"
    );
    metrics::describe_counter!("deliveries_total", "Delivery attempts, by channel and status");
    metrics::describe_histogram!(
        "delivery_duration_seconds",
        "Delivery duration in seconds"
    );
    metrics::describe_counter!(
        "overflow_drained_total",
        "Overflow entries re-offered by the drain, by outcome"
    );
    metrics::describe_gauge!(
        "store_retry_buffered",
        "Tasks held locally while the counter store is unavailable"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一条日志消息的处理结果（decoded / decode_error / read_error）
#[inline]
pub fn record_record(outcome: &'static str) {
    metrics::counter!("notification_records_total", "outcome" => outcome).increment(1);
}

/// 记录准入决策（allowed / denied / store_unavailable）
#[inline]
pub fn record_admission(decision: &'static str) {
    metrics::counter!("admission_decisions_total", "decision" => decision).increment(1);
}

/// 记录工作池提交
#[inline]
pub fn record_pool_submit(pool_id: usize) {
    metrics::counter!("pool_submissions_total", "pool" => pool_id.to_string()).increment(1);
}

/// 记录一次投递
#[inline]
pub fn record_delivery(channel: &'static str, status: &'static str, duration_secs: f64) {
    metrics::counter!(
        "deliveries_total",
        "channel" => channel,
        "status" => status
    )
    .increment(1);

    metrics::histogram!("delivery_duration_seconds", "channel" => channel)
        .record(duration_secs);
}

/// 记录溢出回放结果（admitted / requeued / discarded）
#[inline]
pub fn record_overflow_drained(outcome: &'static str) {
    metrics::counter!("overflow_drained_total", "outcome" => outcome).increment(1);
}

/// 更新本地暂存任务数
#[inline]
pub fn set_store_retry_buffered(len: usize) {
    metrics::gauge!("store_retry_buffered").set(len as f64);
}
