use crate::{InterferoError, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct ExporterState {
    registry: Registry,
    health: HealthCheck,
}

/// Serves the agent's registry in the Prometheus text format
pub struct PrometheusExporter {
    registry: Registry,
    addr: SocketAddr,
    health: HealthCheck,
}

impl PrometheusExporter {
    pub fn new(registry: Registry, addr: SocketAddr) -> Self {
        Self {
            registry,
            addr,
            health: Arc::new(|| true),
        }
    }

    /// Readiness reported on `/healthz`
    pub fn with_health<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.health = Arc::new(check);
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(health_handler))
            .with_state(ExporterState {
                registry: self.registry.clone(),
                health: self.health.clone(),
            })
    }

    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting Prometheus exporter on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| InterferoError::MetricsError(format!("exporter failed: {}", e)))
    }

    pub fn format_current_metrics(&self) -> Result<String> {
        format_metrics(&self.registry)
    }
}

pub fn format_metrics(registry: &Registry) -> Result<String> {
    Ok(TextEncoder::new().encode_to_string(&registry.gather())?)
}

async fn metrics_handler(State(state): State<ExporterState>) -> Response {
    match format_metrics(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

async fn health_handler(State(state): State<ExporterState>) -> Response {
    if (state.health)() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Gauge, Opts};

    #[test]
    fn test_format_metrics() {
        let registry = Registry::new();
        let gauge = Gauge::with_opts(Opts::new("interfero_test", "help text")).unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();
        gauge.set(42.0);

        let exporter = PrometheusExporter::new(registry, "127.0.0.1:0".parse().unwrap());
        let text = exporter.format_current_metrics().unwrap();
        assert!(text.contains("# TYPE interfero_test gauge"));
        assert!(text.contains("interfero_test 42"));
    }
}
