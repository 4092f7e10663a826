//! Admin server: health probes and metrics on a dedicated port.
//!
//! | Endpoint | Condition | Status |
//! |----------|-----------|--------|
//! | `/health` | process alive | 200 |
//! | `/health` | stopped | 503 |
//! | `/ready` | ready and all checks pass | 200 |
//! | `/ready` | starting, shutting down or a check failing | 503 |
//! | `/metrics` | always | 200 (OpenMetrics text) |

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::lifecycle::{LifecycleManager, LifecycleState, ReadinessChecks};
use crate::ports::admin_port;

/// Admin server configuration.
#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    pub port: u16,
    pub bind_addr: String,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            port: admin_port(),
            bind_addr: "127.0.0.1".to_string(),
        }
    }
}

impl AdminServerConfig {
    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[derive(Clone)]
struct AdminState {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<Registry>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Serves `/health`, `/ready` and `/metrics`.
pub struct AdminServer {
    config: AdminServerConfig,
    state: AdminState,
}

impl AdminServer {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<Registry>,
        config: AdminServerConfig,
    ) -> Self {
        Self {
            config,
            state: AdminState {
                lifecycle,
                registry,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind_addr = self.config.bind_string();
        let listener = TcpListener::bind(&bind_addr).await?;

        info!(addr = %bind_addr, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Admin server shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn health_handler(State(state): State<AdminState>) -> Response {
    let lifecycle = &state.lifecycle;
    let (status_code, status) = if lifecycle.state() == LifecycleState::Stopped {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            version: lifecycle.version(),
            uptime_seconds: lifecycle.uptime_seconds(),
        }),
    )
        .into_response()
}

async fn readiness_handler(State(state): State<AdminState>) -> Response {
    let lifecycle = &state.lifecycle;
    let checks = lifecycle.readiness_checks();

    let reason = if lifecycle.is_shutting_down() {
        Some("shutting_down".to_string())
    } else if let Some(failed) = checks.first_failure() {
        Some(failed.to_string())
    } else if !lifecycle.is_ready() {
        Some(format!("lifecycle_state: {}", lifecycle.state()))
    } else {
        None
    };

    let (status_code, status) = match reason {
        None => (StatusCode::OK, "ready"),
        Some(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
    };

    (
        status_code,
        Json(ReadinessResponse {
            status,
            checks,
            reason,
        }),
    )
        .into_response()
}

async fn metrics_handler(State(state): State<AdminState>) -> Response {
    let mut buffer = String::new();

    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tourgate_core::telemetry::GatewayMetrics;
    use tower::ServiceExt;

    fn admin(lifecycle: Arc<LifecycleManager>, registry: Registry) -> Router {
        AdminServer::new(lifecycle, Arc::new(registry), AdminServerConfig::default()).router()
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_version_and_uptime() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        let (status, json) = get_json(admin(lifecycle, Registry::default()), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert!(json["version"].is_string());
        assert!(json["uptime_seconds"].is_number());
    }

    #[tokio::test]
    async fn test_health_unavailable_once_stopped() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_stopped();
        let (status, json) = get_json(admin(lifecycle, Registry::default()), "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_readiness_not_ready_during_startup() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_templates_loaded();
        lifecycle.mark_history_ready();
        let (status, json) = get_json(admin(lifecycle, Registry::default()), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "not_ready");
        assert_eq!(json["reason"], "lifecycle_state: starting");
    }

    #[tokio::test]
    async fn test_readiness_ready_in_offline_mode() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_templates_loaded();
        lifecycle.mark_history_ready();
        lifecycle.set_upstream_configured(false);
        lifecycle.mark_ready();
        let (status, json) = get_json(admin(lifecycle, Registry::default()), "/ready").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ready");
        assert_eq!(json["checks"]["upstream_configured"], false);
        assert!(json.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_readiness_reports_shutdown() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_templates_loaded();
        lifecycle.mark_history_ready();
        lifecycle.mark_ready();
        lifecycle.begin_shutdown();
        let (status, json) = get_json(admin(lifecycle, Registry::default()), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "shutting_down");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exports_gateway_metrics() {
        let mut registry = Registry::default();
        let metrics = GatewayMetrics::new(&mut registry);
        metrics.record_reply("template");
        metrics.record_admission_rejection("cooldown");

        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = admin(lifecycle, registry).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .expect("Content-Type header should be present")
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("openmetrics"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("tourgate_requests_total"));
        assert!(text.contains("source=\"template\""));
        assert!(text.contains("tourgate_admission_rejections_total"));
    }

    #[test]
    fn test_admin_config_bind_string() {
        let config = AdminServerConfig {
            port: 9000,
            bind_addr: "0.0.0.0".to_string(),
        };
        assert_eq!(config.bind_string(), "0.0.0.0:9000");
    }
}
