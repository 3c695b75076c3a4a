use crate::controller::ModeController;
use crate::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub total_responses: AtomicU64,
    // Login rewriting
    pub login_rewrites: AtomicU64,
    pub credential_timeouts: AtomicU64,
    // Response mutation
    pub substitutions_applied: AtomicU64,
    pub substitution_failures: AtomicU64,
    pub watched_mutations: AtomicU64,
    pub malformed_bodies: AtomicU64,
    pub extension_failures: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub controller: ModeController,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeBody {
    pub enabled: bool,
}

#[derive(Serialize)]
struct MetricsResponse {
    enabled: bool,
    total_requests: u64,
    total_responses: u64,
    login: LoginMetrics,
    mutation: MutationMetrics,
}

#[derive(Serialize)]
struct LoginMetrics {
    rewrites: u64,
    credential_timeouts: u64,
}

#[derive(Serialize)]
struct MutationMetrics {
    substitutions_applied: u64,
    substitution_failures: u64,
    watched_mutations: u64,
    malformed_bodies: u64,
    extension_failures: u64,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/mode", get(get_mode_handler).put(put_mode_handler))
        .with_state(state)
}

pub async fn start_admin_server(
    port: u16,
    metrics: Arc<Metrics>,
    controller: ModeController,
) -> Result<()> {
    let app = admin_router(AdminState {
        metrics,
        controller,
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::error::ProxyError::Network(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::ProxyError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_mode_handler(State(state): State<AdminState>) -> Json<ModeBody> {
    Json(ModeBody {
        enabled: state.controller.is_enabled(),
    })
}

async fn put_mode_handler(
    State(state): State<AdminState>,
    Json(body): Json<ModeBody>,
) -> Json<ModeBody> {
    state.controller.set_enabled(body.enabled);
    Json(ModeBody {
        enabled: state.controller.is_enabled(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> Json<MetricsResponse> {
    let metrics = &state.metrics;
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

    Json(MetricsResponse {
        enabled: state.controller.is_enabled(),
        total_requests: load(&metrics.total_requests),
        total_responses: load(&metrics.total_responses),
        login: LoginMetrics {
            rewrites: load(&metrics.login_rewrites),
            credential_timeouts: load(&metrics.credential_timeouts),
        },
        mutation: MutationMetrics {
            substitutions_applied: load(&metrics.substitutions_applied),
            substitution_failures: load(&metrics.substitution_failures),
            watched_mutations: load(&metrics.watched_mutations),
            malformed_bodies: load(&metrics.malformed_bodies),
            extension_failures: load(&metrics.extension_failures),
        },
    })
}
