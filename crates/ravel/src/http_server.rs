//! HTTP server for the Prometheus metrics endpoint.

use crate::metrics::WorkerMetrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus_client::encoding::text::encode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    registry: Arc<WorkerMetrics>,
    listen_addr: String,
}

impl MetricsServer {
    pub fn new(registry: Arc<WorkerMetrics>, listen_addr: String) -> Self {
        Self {
            registry,
            listen_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self) -> common::Result<()> {
        info!(listen_addr = %self.listen_addr, "starting metrics HTTP server");

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.registry);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "metrics server listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| common::Error::other(format!("metrics server failed: {}", e)))?;
        Ok(())
    }
}

/// Handler for the /metrics endpoint
async fn metrics_handler(State(registry): State<Arc<WorkerMetrics>>) -> Response {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry.registry) {
        warn!(error = %e, "failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}
