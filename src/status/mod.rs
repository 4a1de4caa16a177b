//! Local status endpoint for supervisors and container health probes.
//!
//! - `GET /health`: 200 while registered with the control server, 503 otherwise
//! - `GET /status`: connection state, node id, capacity and job counters

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::connection::ConnectionState;
use crate::identity::{NodeIdentity, AGENT_VERSION};
use crate::scheduler::{AdmissionController, CapacitySnapshot};
use crate::stats::{AgentStats, StatsSnapshot};

#[derive(Clone)]
pub struct StatusState {
    pub identity: Arc<NodeIdentity>,
    pub stats: Arc<AgentStats>,
    pub admission: Arc<RwLock<AdmissionController>>,
    pub connection: watch::Receiver<ConnectionState>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    healthy: bool,
    state: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    state: String,
    node_id: Option<String>,
    hostname: String,
    agent_version: &'static str,
    capacity: CapacitySnapshot,
    stats: StatsSnapshot,
}

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the status endpoint until `shutdown` fires. Bind failures are
/// logged; the agent keeps running without the endpoint.
pub async fn run_status_server(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };
    tracing::info!(addr = %addr, "Status server listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let current = *state.connection.borrow();
    let healthy = current == ConnectionState::Registered;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            healthy,
            state: current.to_string(),
        }),
    )
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let current = *state.connection.borrow();
    let capacity = state.admission.read().await.snapshot();

    Json(StatusResponse {
        state: current.to_string(),
        node_id: state.identity.node_id().map(str::to_string),
        hostname: state.identity.host_info().hostname.clone(),
        agent_version: AGENT_VERSION,
        capacity,
        stats: state.stats.snapshot(),
    })
}
