//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 未安装 recorder 时所有记录函数都是空操作。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::config::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    addr: SocketAddr,
}

impl MetricsHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// 初始化 Prometheus 指标导出
///
/// exporter 自带的 HTTP listener 在指定端口暴露 `/metrics`，需在 tokio 运行时内调用。
pub fn init(config: &ObservabilityConfig, service_name: &str) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_common_metrics(service_name);
    info!("Metrics exporter listening on {}", addr);

    Ok(MetricsHandle { addr })
}

/// 注册指标描述，会出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("lock_acquire_total", "Lock acquisition attempts by outcome");
    metrics::describe_histogram!(
        "lock_acquire_wait_seconds",
        "Time spent waiting for a lock, in seconds"
    );
    metrics::describe_counter!("lock_release_total", "Lock releases by outcome");
    metrics::describe_counter!("cache_operations_total", "Cache operations by kind and outcome");
    metrics::describe_counter!(
        "store_connection_errors_total",
        "Failures to borrow a store connection"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次抢锁结果（acquired / timeout / busy / error）
#[inline]
pub fn record_lock_acquire(outcome: &'static str, wait_secs: f64) {
    metrics::counter!("lock_acquire_total", "outcome" => outcome).increment(1);
    metrics::histogram!("lock_acquire_wait_seconds", "outcome" => outcome).record(wait_secs);
}

/// 记录一次释放锁结果（released / mismatch）
#[inline]
pub fn record_lock_release(outcome: &'static str) {
    metrics::counter!("lock_release_total", "outcome" => outcome).increment(1);
}

/// 记录缓存操作
#[inline]
pub fn record_cache_operation(operation: &'static str, outcome: &'static str) {
    metrics::counter!(
        "cache_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

/// 记录连接获取失败
#[inline]
pub fn record_connection_error(mode: &'static str) {
    metrics::counter!("store_connection_errors_total", "mode" => mode).increment(1);
}
