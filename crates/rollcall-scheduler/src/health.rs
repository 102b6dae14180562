//! Health endpoint for the scheduler daemons.
//!
//! Reports broker reachability, checked by opening and immediately closing
//! a connection, together with the per-queue dead-letter health kept by
//! the drain. Served with axum when a health address is configured.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use rollcall_core::Clock;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::{
    broker::AmqpBroker,
    daemon::DaemonStats,
    dead_letter::{DeadLetterStats, QueueHealth},
    error::Result,
};

/// Checks that the broker accepts connections.
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    /// Opens and closes one connection.
    async fn probe(&self) -> Result<()>;
}

/// [`BrokerProbe`] against an AMQP URL.
pub struct AmqpProbe {
    url: String,
}

impl AmqpProbe {
    /// Creates a probe for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerProbe for AmqpProbe {
    async fn probe(&self) -> Result<()> {
        AmqpBroker::probe(&self.url).await
    }
}

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Daemon counters, when served from inside a scheduler daemon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonStats>,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Broker reachable and every dead-letter queue draining
    Healthy,
    /// Broker unreachable or a dead-letter queue failing repeatedly
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Broker reachability
    pub broker: ComponentHealth,
    /// One entry per drained dead-letter queue
    pub dead_letter_queues: Vec<QueueCheck>,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Dead-letter health of one primary queue.
#[derive(Debug, Serialize)]
pub struct QueueCheck {
    /// Primary queue name
    pub queue: String,
    /// Up while below the consecutive-failure threshold
    pub status: ComponentStatus,
    /// Running counters
    #[serde(flatten)]
    pub health: QueueHealth,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Builds health reports from a broker probe and drain stats.
pub struct HealthService {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn BrokerProbe>,
}

impl HealthService {
    /// Creates a health service.
    pub fn new(clock: Arc<dyn Clock>, probe: Arc<dyn BrokerProbe>) -> Self {
        Self { clock, probe }
    }

    /// Probes the broker and folds in dead-letter health.
    pub async fn health_check(&self, dead_letters: &DeadLetterStats) -> HealthResponse {
        debug!("performing health check");

        let timestamp = self.clock.now_utc();
        let broker = self.check_broker().await;

        let dead_letter_queues: Vec<QueueCheck> = dead_letters
            .queues()
            .map(|(queue, health)| QueueCheck {
                queue: queue.to_string(),
                status: if health.is_healthy() { ComponentStatus::Up } else { ComponentStatus::Down },
                health: health.clone(),
            })
            .collect();

        let status = if broker.status == ComponentStatus::Up && dead_letters.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthResponse {
            status,
            timestamp,
            checks: HealthChecks { broker, dead_letter_queues },
            daemon: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_broker(&self) -> ComponentHealth {
        let start = self.clock.now();
        let result = self.probe.probe().await;
        let response_time_ms =
            u64::try_from(self.clock.now().duration_since(start).as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                debug!("broker health check passed");
                ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms }
            },
            Err(e) => {
                error!(error = %e, "broker health check failed");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("broker unreachable: {e}")),
                    response_time_ms,
                }
            },
        }
    }
}

/// Shared state for the health routes.
#[derive(Clone)]
pub struct HealthState {
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Broker reachability check.
    pub probe: Arc<dyn BrokerProbe>,
    /// Dead-letter stats of the drain running in this process.
    pub dead_letters: Arc<RwLock<DeadLetterStats>>,
    /// Counters of the scheduler daemon running in this process, if any.
    pub daemon: Option<Arc<RwLock<DaemonStats>>>,
    /// Service name reported by the liveness route.
    pub service: &'static str,
}

/// Health check endpoint handler.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<HealthState>) -> Response {
    let service = HealthService::new(state.clock.clone(), state.probe.clone());
    let dead_letters = state.dead_letters.read().await.clone();
    let mut response = service.health_check(&dead_letters).await;
    if let Some(daemon) = &state.daemon {
        response.daemon = Some(daemon.read().await.clone());
    }

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        broker_status = ?response.checks.broker.status,
        "health check completed"
    );

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint.
///
/// Does not touch the broker; only shows the process is serving.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<HealthState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": state.service,
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// Creates the health router.
pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/live", get(liveness_check))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut response = next.run(req).await;
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the health routes on `addr` until `shutdown` fires.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn serve(
    addr: SocketAddr,
    state: HealthState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
