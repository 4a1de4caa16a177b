
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tower::ServiceExt;

use hypernode_agent::config::CapacityConfig;
use hypernode_agent::connection::ConnectionState;
use hypernode_agent::scheduler::{AdmissionController, JobAssignment, JobStatus};
use hypernode_agent::stats::AgentStats;
use hypernode_agent::status::{router, StatusState};

use test_harness::{test_identity, TEST_NODE_ID};

/// Helper to create test state
fn create_test_state(
    state: ConnectionState,
) -> (StatusState, watch::Sender<ConnectionState>) {
    let (tx, rx) = watch::channel(state);
    let capacity = CapacityConfig {
        max_concurrent_jobs: 3,
        max_queued_jobs: 5,
        cpu_budget: 4.0,
        gpu_devices: vec![0],
    };
    let status = StatusState {
        identity: test_identity(),
        stats: Arc::new(AgentStats::new()),
        admission: Arc::new(RwLock::new(AdmissionController::new(&capacity, 1.0))),
        connection: rx,
    };
    (status, tx)
}

async fn get(state: StatusState, uri: &str) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_ok_when_registered() {
    let (state, _tx) = create_test_state(ConnectionState::Registered);

    let (status, body) = get(state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["state"], "registered");
}

#[tokio::test]
async fn test_health_unavailable_while_reconnecting() {
    let (state, tx) = create_test_state(ConnectionState::Registered);
    tx.send_replace(ConnectionState::Reconnecting);

    let (status, body) = get(state, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["healthy"], false);
    assert_eq!(body["state"], "reconnecting");
}

#[tokio::test]
async fn test_status_reports_capacity_and_stats() {
    let (state, _tx) = create_test_state(ConnectionState::Registered);
    state.identity.assign(TEST_NODE_ID);
    state
        .admission
        .write()
        .await
        .try_admit(&JobAssignment::new("j1", "echo"));
    state.stats.record_outcome(JobStatus::Completed);
    state.stats.record_rejection();

    let (status, body) = get(state, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "registered");
    assert_eq!(body["nodeId"], TEST_NODE_ID);
    assert_eq!(body["hostname"], "test-host");
    assert_eq!(body["capacity"]["maxConcurrentJobs"], 3);
    assert_eq!(body["capacity"]["runningJobs"], 1);
    assert_eq!(body["capacity"]["cpuTotal"], 4.0);
    assert_eq!(body["capacity"]["cpuReserved"], 1.0);
    assert_eq!(body["capacity"]["gpuTotal"], 1);
    assert_eq!(body["stats"]["jobsCompleted"], 1);
    assert_eq!(body["stats"]["jobsRejected"], 1);
}

#[tokio::test]
async fn test_status_before_registration_has_no_node_id() {
    let (state, _tx) = create_test_state(ConnectionState::Connecting);

    let (status, body) = get(state, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "connecting");
    assert!(body["nodeId"].is_null());
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (state, _tx) = create_test_state(ConnectionState::Registered);

    let response = router(state)
        .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
