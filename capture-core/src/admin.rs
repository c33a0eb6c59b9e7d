use crate::Result;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_flows: AtomicU64,
    pub forwarded_flows: AtomicU64,
    pub intercepted_flows: AtomicU64,
    pub captures_written: AtomicU64,
    pub capture_failures: AtomicU64,
    pub malformed_payloads: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub fatal_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_flows: u64,
    pub forwarded_flows: u64,
    pub intercepted_flows: u64,
    pub captures_written: u64,
    pub capture_failures: u64,
    pub malformed_payloads: u64,
    pub upstream_errors: u64,
    pub fatal_errors: u64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_flows: self.total_flows.load(Ordering::Relaxed),
            forwarded_flows: self.forwarded_flows.load(Ordering::Relaxed),
            intercepted_flows: self.intercepted_flows.load(Ordering::Relaxed),
            captures_written: self.captures_written.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

pub fn admin_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || metrics_handler(metrics)))
}

pub async fn start_admin_server(port: u16, metrics: Arc<Metrics>) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::error::ProxyError::Network(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, admin_router(metrics))
        .await
        .map_err(|e| crate::error::ProxyError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(metrics: Arc<Metrics>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.total_flows);
        Metrics::incr(&metrics.total_flows);
        Metrics::incr(&metrics.captures_written);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_flows, 2);
        assert_eq!(snapshot.captures_written, 1);
        assert_eq!(snapshot.upstream_errors, 0);
    }
}
