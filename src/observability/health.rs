//! Health check HTTP server for container orchestration
//!
//! Serves the coordinator health snapshot, metrics and Kubernetes-style
//! readiness and liveness probes.

use crate::error::{CoordError, CoordResult};
use crate::health::HealthSource;
use crate::observability::metrics::MetricsCollector;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::info;
use warp::Filter;
use warp::http::StatusCode;

/// HTTP health check server
pub struct HealthServer {
    coordinator_id: String,
    port: u16,
    metrics: Arc<MetricsCollector>,
    source: Arc<dyn HealthSource>,
    ready: AtomicBool,
}

impl HealthServer {
    pub fn new(
        coordinator_id: impl Into<String>,
        port: u16,
        metrics: Arc<MetricsCollector>,
        source: Arc<dyn HealthSource>,
    ) -> Self {
        Self {
            coordinator_id: coordinator_id.into(),
            port,
            metrics,
            source,
            ready: AtomicBool::new(false),
        }
    }

    /// Readiness flips once startup recovery has finished
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Bind and serve until `shutdown` turns true. Returns the bound address.
    pub fn start(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> CoordResult<SocketAddr> {
        let health_server = Arc::clone(&self);
        let metrics_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);

        // GET /health - component checks and counts
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = Arc::clone(&health_server);
            async move {
                let status = server.source.health().await;
                let code = if status.healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                let body = HealthResponse {
                    coordinator_id: &server.coordinator_id,
                    uptime_seconds: server.metrics.snapshot().uptime_seconds,
                    status,
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&body), code))
            }
        });

        // GET /metrics
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
            let server = Arc::clone(&metrics_server);
            async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.snapshot())) }
        });

        // GET /ready - Kubernetes readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = Arc::clone(&ready_server);
            async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - Kubernetes liveness probe
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Coordinator health with component checks"),
                ("/metrics", "Message, invocation, security and workflow metrics"),
                ("/ready", "Readiness probe for Kubernetes"),
                ("/live", "Liveness probe for Kubernetes"),
            ]);
            warp::reply::json(&endpoints)
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin());

        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| CoordError::internal(format!("health server bind failed: {e}")))?;

        info!(%addr, "Health server listening");
        tokio::spawn(server);
        Ok(addr)
    }
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    coordinator_id: &'a str,
    uptime_seconds: u64,
    #[serde(flatten)]
    status: crate::health::HealthStatus,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::routing::RouterStats;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedHealth(bool);

    #[async_trait]
    impl HealthSource for FixedHealth {
        async fn health(&self) -> HealthStatus {
            HealthStatus {
                healthy: self.0,
                agents_registered: 2,
                agents_online: 1,
                tool_instances: 3,
                tools_online: 3,
                sessions: 0,
                active_workflows: 0,
                router: RouterStats::default(),
                components: Vec::new(),
                timestamp: Utc::now(),
            }
        }
    }

    fn server(healthy: bool) -> Arc<HealthServer> {
        Arc::new(HealthServer::new(
            "coordinator",
            0,
            Arc::new(MetricsCollector::new()),
            Arc::new(FixedHealth(healthy)),
        ))
    }

    #[tokio::test]
    async fn test_readiness_flag() {
        let server = server(true);
        assert!(!server.is_ready());
        server.set_ready(true);
        assert!(server.is_ready());
    }

    #[tokio::test]
    async fn test_endpoints_over_http() {
        let (tx, rx) = watch::channel(false);
        let server = server(false);
        let addr = Arc::clone(&server).start(rx).unwrap();
        let base = format!("http://127.0.0.1:{}", addr.port());
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status().as_u16(), 503);
        let body: serde_json::Value = health.json().await.unwrap();
        assert_eq!(body["coordinator_id"], "coordinator");
        assert_eq!(body["agents_registered"], 2);

        let ready = client.get(format!("{base}/ready")).send().await.unwrap();
        assert_eq!(ready.status().as_u16(), 503);
        server.set_ready(true);
        let ready = client.get(format!("{base}/ready")).send().await.unwrap();
        assert_eq!(ready.status().as_u16(), 200);

        let metrics: serde_json::Value = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(metrics["messages"].is_object());

        let live = client.get(format!("{base}/live")).send().await.unwrap();
        assert_eq!(live.status().as_u16(), 200);

        tx.send(true).unwrap();
    }
}
