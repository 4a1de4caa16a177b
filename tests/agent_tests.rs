
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hypernode_agent::agent::Agent;
use hypernode_agent::config::AgentConfig;
use hypernode_agent::error::AgentError;
use hypernode_agent::stats::AgentStats;

use test_harness::{
    test_config, test_identity, wait_until, MockServer, ShellRuntime, TEST_NODE_ID,
};

const WAIT: Duration = Duration::from_secs(10);

struct RunningAgent {
    shutdown: CancellationToken,
    stats: Arc<AgentStats>,
    task: JoinHandle<Result<(), AgentError>>,
}

impl RunningAgent {
    async fn stop(self) -> Result<(), AgentError> {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("agent did not stop")
            .expect("agent task panicked")
    }
}

fn heartbeat_time(frame: &Value) -> DateTime<Utc> {
    frame["timestamp"]
        .as_str()
        .expect("heartbeat timestamp")
        .parse()
        .expect("RFC 3339 timestamp")
}

async fn http_get(addr: &str, path: &str) -> Option<String> {
    let mut stream = tokio::net::TcpStream::connect(addr).await.ok()?;
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await.ok()?;
    Some(response)
}

fn start_agent(config: AgentConfig, runtime: Arc<ShellRuntime>) -> RunningAgent {
    let agent = Agent::new(config, runtime, test_identity());
    let stats = agent.stats();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(agent.run(shutdown.clone()));
    RunningAgent {
        shutdown,
        stats,
        task,
    }
}

#[tokio::test]
async fn test_job_runs_and_result_is_reported() {
    let mut server = MockServer::start().await;
    let agent = start_agent(test_config(&server.url()), ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("job-1", "echo done");

    let result = server.recv_kind("jobResult", WAIT).await.expect("jobResult");
    assert_eq!(result["jobId"], "job-1");
    assert_eq!(result["nodeId"], TEST_NODE_ID);
    assert_eq!(result["status"], "completed");
    assert_eq!(result["result"]["exitCode"], 0);
    assert_eq!(result["result"]["logs"], "done\n");
    assert_eq!(result["result"]["executionHash"].as_str().unwrap().len(), 64);
    assert_eq!(result["result"]["logsHash"].as_str().unwrap().len(), 64);

    assert_eq!(agent.stats.snapshot().jobs_completed, 1);
    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_invalid_token_exits_with_rejection() {
    let mut server = MockServer::rejecting().await;
    let agent = start_agent(test_config(&server.url()), ShellRuntime::new());

    let result = tokio::time::timeout(WAIT, agent.task).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, AgentError::RegistrationRejected(_)));
    assert_eq!(err.exit_code(), 2);

    // Nothing but the one registration attempt
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frames = server.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "register");
}

#[tokio::test]
async fn test_sends_heartbeats_with_stats() {
    let mut server = MockServer::start().await;
    let agent = start_agent(test_config(&server.url()), ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    let heartbeat = server.recv_kind("heartbeat", WAIT).await.expect("heartbeat");
    assert_eq!(heartbeat["nodeId"], TEST_NODE_ID);
    assert!(heartbeat["timestamp"].is_string());
    assert_eq!(heartbeat["stats"]["jobsCompleted"], 0);
    assert_eq!(heartbeat["stats"]["activeJobs"], 0);

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_concurrency_limit_runs_jobs_in_order() {
    let mut server = MockServer::start().await;
    let mut config = test_config(&server.url());
    config.capacity.max_concurrent_jobs = 1;
    let agent = start_agent(config, ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("job-a", "sleep 0.3\necho a");
    server.send_job("job-b", "echo b");

    let first = server.recv_kind("jobResult", WAIT).await.expect("first result");
    let second = server.recv_kind("jobResult", WAIT).await.expect("second result");
    assert_eq!(first["jobId"], "job-a");
    assert_eq!(second["jobId"], "job-b");
    assert_eq!(second["status"], "completed");

    assert_eq!(agent.stats.snapshot().jobs_completed, 2);
    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_full_queue_rejects_job() {
    let mut server = MockServer::start().await;
    let mut config = test_config(&server.url());
    config.capacity.max_concurrent_jobs = 1;
    config.capacity.max_queued_jobs = 1;
    let agent = start_agent(config, ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("running", "sleep 1");
    server.send_job("waiting", "true");
    server.send_job("overflow", "true");

    let rejected = server.recv_kind("jobRejected", WAIT).await.expect("jobRejected");
    assert_eq!(rejected["jobId"], "overflow");
    assert_eq!(rejected["nodeId"], TEST_NODE_ID);
    assert!(rejected["reason"].as_str().unwrap().contains("queue is full"));
    assert_eq!(agent.stats.snapshot().jobs_rejected, 1);

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_timed_out_job_is_reported() {
    let mut server = MockServer::start().await;
    let agent = start_agent(test_config(&server.url()), ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    server.send(json!({
        "type": "job",
        "jobId": "slow",
        "script": "exec sleep 30",
        "timeoutSeconds": 1,
    }));

    let result = server.recv_kind("jobResult", WAIT).await.expect("jobResult");
    assert_eq!(result["jobId"], "slow");
    assert_eq!(result["status"], "timeout");
    assert!(result["result"]["exitCode"].is_null());
    assert_eq!(agent.stats.snapshot().jobs_timed_out, 1);

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_server_cancels_running_job() {
    let mut server = MockServer::start().await;
    let runtime = ShellRuntime::new();
    let agent = start_agent(test_config(&server.url()), runtime.clone());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("doomed", "exec sleep 30");
    assert!(
        wait_until(WAIT, || {
            let runtime = runtime.clone();
            async move { !runtime.spawned().is_empty() }
        })
        .await
    );
    server.send(json!({"type": "jobCancel", "jobId": "doomed"}));

    let result = server.recv_kind("jobResult", WAIT).await.expect("jobResult");
    assert_eq!(result["jobId"], "doomed");
    assert_eq!(result["status"], "failed");
    assert!(result["result"]["logs"].as_str().unwrap().contains("cancelled"));

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_shutdown_terminates_jobs_after_grace_and_reports_them() {
    let mut server = MockServer::start().await;
    let runtime = ShellRuntime::new();
    let mut config = test_config(&server.url());
    config.shutdown_grace = Duration::from_millis(200);
    let agent = start_agent(config, runtime.clone());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("long", "exec sleep 30");
    assert!(
        wait_until(WAIT, || {
            let runtime = runtime.clone();
            async move { !runtime.spawned().is_empty() }
        })
        .await
    );

    assert!(agent.stop().await.is_ok());

    let result = server.recv_kind("jobResult", WAIT).await.expect("jobResult");
    assert_eq!(result["jobId"], "long");
    assert_eq!(result["status"], "failed");
    assert_eq!(runtime.removed(), runtime.spawned());
}

#[tokio::test]
async fn test_shutdown_rejects_queued_jobs() {
    let mut server = MockServer::start().await;
    let runtime = ShellRuntime::new();
    let mut config = test_config(&server.url());
    config.capacity.max_concurrent_jobs = 1;
    let agent = start_agent(config, runtime.clone());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("first", "sleep 0.5");
    server.send_job("second", "true");
    assert!(
        wait_until(WAIT, || {
            let stats = agent.stats.clone();
            async move { stats.snapshot().queued_jobs == 1 }
        })
        .await
    );

    assert!(agent.stop().await.is_ok());

    let rejected = server.recv_kind("jobRejected", WAIT).await.expect("jobRejected");
    assert_eq!(rejected["jobId"], "second");
    assert!(rejected["reason"].as_str().unwrap().contains("shutting down"));
}

#[tokio::test]
async fn test_heartbeats_keep_configured_cadence() {
    let mut server = MockServer::start().await;
    let mut config = test_config(&server.url());
    config.heartbeat_interval = Duration::from_millis(200);
    let agent = start_agent(config, ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    let mut times = Vec::new();
    while times.len() < 6 {
        let heartbeat = server.recv_kind("heartbeat", WAIT).await.expect("heartbeat");
        times.push(heartbeat_time(&heartbeat));
    }

    for pair in times.windows(2) {
        let gap = (pair[1] - pair[0]).num_milliseconds();
        assert!((150..=450).contains(&gap), "heartbeat gap {}ms", gap);
    }

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_outage_results_flush_in_order_and_heartbeats_resume() {
    let mut server = MockServer::start().await;
    let runtime = ShellRuntime::new();
    let agent = start_agent(test_config(&server.url()), runtime.clone());
    assert!(server.wait_registered(1, WAIT).await);

    server.send_job("first", "sleep 0.4\necho first");
    server.send_job("second", "sleep 0.8\necho second");
    assert!(
        wait_until(WAIT, || {
            let runtime = runtime.clone();
            async move { runtime.spawned().len() == 2 }
        })
        .await
    );

    server.set_offline(true);
    server.disconnect();
    let outage_start = Utc::now();

    // Both jobs finish while nobody is listening
    assert!(
        wait_until(WAIT, || {
            let stats = agent.stats.clone();
            async move { stats.snapshot().jobs_completed == 2 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    let outage_end = Utc::now();
    server.set_offline(false);
    assert!(server.wait_registered(2, WAIT).await);

    let mut results = Vec::new();
    let mut resumed = None;
    while results.len() < 2 || resumed.is_none() {
        let frame = server.next_message(WAIT).await.expect("frame");
        match frame["type"].as_str() {
            Some("jobResult") => results.push(frame["jobId"].as_str().unwrap().to_string()),
            Some("heartbeat") => {
                let sent = heartbeat_time(&frame);
                // Nothing produced while the link was down may reach the server
                assert!(
                    sent < outage_start + chrono::Duration::milliseconds(200) || sent > outage_end,
                    "heartbeat from the outage delivered: {}",
                    sent
                );
                if sent > outage_end {
                    resumed = Some(frame);
                }
            }
            _ => {}
        }
    }

    assert_eq!(results, vec!["first", "second"]);
    let heartbeat = resumed.unwrap();
    assert_eq!(heartbeat["stats"]["jobsCompleted"], 2);
    assert_eq!(heartbeat["stats"]["activeJobs"], 0);

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_cancelling_queued_job_starts_the_one_behind_it() {
    let mut server = MockServer::start().await;
    let mut config = test_config(&server.url());
    config.capacity.max_concurrent_jobs = 4;
    config.capacity.cpu_budget = 4.0;
    config.shutdown_grace = Duration::from_millis(200);
    let agent = start_agent(config, ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    server.send(json!({"type": "job", "jobId": "hog", "script": "exec sleep 30", "cpuLimit": 3.0}));
    server.send(json!({"type": "job", "jobId": "big", "script": "true", "cpuLimit": 2.0}));
    server.send(json!({"type": "job", "jobId": "small", "script": "echo small", "cpuLimit": 0.5}));
    assert!(
        wait_until(WAIT, || {
            let stats = agent.stats.clone();
            async move { stats.snapshot().queued_jobs == 2 }
        })
        .await
    );

    server.send(json!({"type": "jobCancel", "jobId": "big"}));

    // "hog" holds its cores for 30s, so this only arrives if "small" started now
    let result = server
        .recv_kind("jobResult", Duration::from_secs(3))
        .await
        .expect("small ran after big was cancelled");
    assert_eq!(result["jobId"], "small");
    assert_eq!(result["result"]["logs"], "small\n");

    assert!(agent.stop().await.is_ok());
}

#[tokio::test]
async fn test_status_server_stops_with_agent() {
    let server = MockServer::start().await;
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = test_config(&server.url());
    config.status_port = Some(port);
    let agent = start_agent(config, ShellRuntime::new());
    assert!(server.wait_registered(1, WAIT).await);

    let addr = format!("127.0.0.1:{}", port);
    assert!(
        wait_until(WAIT, || {
            let addr = addr.clone();
            async move {
                http_get(&addr, "/health")
                    .await
                    .is_some_and(|response| response.starts_with("HTTP/1.1 200"))
            }
        })
        .await
    );

    assert!(agent.stop().await.is_ok());
    assert!(tokio::net::TcpStream::connect(&addr).await.is_err());
}
