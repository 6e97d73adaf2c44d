//! Metrics collection for the key-value service.
//!
//! Collects request counts and latencies per method and exposes them through
//! the Prometheus registry served by the metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("kv_request_counter", "request counter"),
        &["method"]
    )
    .unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("kv_method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Counter for snapshot payload writes that failed
    pub static ref SNAPSHOT_FAILURE_COUNTER: Counter = Counter::new(
        "kv_snapshot_failure_total",
        "snapshot payload save failures"
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_FAILURE_COUNTER.clone()));
}

/// Counts the request and records the handler's wall time under the method
/// label.
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> Result<T, tonic::Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, tonic::Status>> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}
