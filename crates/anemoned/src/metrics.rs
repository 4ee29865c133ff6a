//! Prometheus /metrics + liveness HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::{encoding::text::encode, metrics::counter::Counter, registry::Registry};
use std::sync::Arc;

/// Counters exported by the daemon
#[derive(Clone, Default)]
pub struct DaemonMetrics {
    pub manifests_built: Counter,
    pub manifest_failures: Counter,
    pub watcher_events: Counter,
    pub debounced_regenerations: Counter,
}

impl DaemonMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "anemone_manifests_built",
            "Manifests built and persisted",
            metrics.manifests_built.clone(),
        );
        registry.register(
            "anemone_manifest_failures",
            "Manifest builds that failed",
            metrics.manifest_failures.clone(),
        );
        registry.register(
            "anemone_watcher_events",
            "Filesystem events received by the change watcher",
            metrics.watcher_events.clone(),
        );
        registry.register(
            "anemone_debounced_regenerations",
            "Manifest regenerations triggered by the change watcher",
            metrics.debounced_regenerations.clone(),
        );
        metrics
    }
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(registry)
}

/// Serve metrics and health endpoints on `addr` (e.g. "127.0.0.1:9110")
pub async fn serve(addr: String, registry: Arc<Registry>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz");

    axum::serve(listener, router(registry))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_exposes_counters() {
        let mut registry = Registry::default();
        let metrics = DaemonMetrics::new(&mut registry);
        metrics.manifests_built.inc_by(3);
        metrics.watcher_events.inc();

        let (status, body) = get_body(router(Arc::new(registry)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("anemone_manifests_built_total 3"), "{body}");
        assert!(body.contains("anemone_watcher_events_total 1"), "{body}");
        assert!(body.contains("anemone_manifest_failures_total 0"), "{body}");
        assert!(body.contains("anemone_debounced_regenerations_total 0"), "{body}");
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get_body(router(Arc::new(Registry::default())), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
