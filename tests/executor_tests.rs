
use std::sync::Arc;
use std::time::{Duration, Instant};

use hypernode_agent::config::SandboxConfig;
use hypernode_agent::scheduler::{JobAssignment, JobStatus, ResourceClass, Reservation};
use hypernode_agent::worker::runner::TRUNCATION_MARKER;
use hypernode_agent::worker::JobExecutor;
use tokio_util::sync::CancellationToken;

use test_harness::ShellRuntime;

fn sandbox() -> SandboxConfig {
    SandboxConfig {
        interpreter: "sh".to_string(),
        kill_grace: Duration::from_secs(1),
        max_log_size: 10_000,
        ..SandboxConfig::default()
    }
}

fn reservation(job: &JobAssignment) -> Reservation {
    Reservation {
        job_id: job.job_id.clone(),
        class: ResourceClass::Cpu,
        cpu_millis: 1000,
        gpu_device: None,
    }
}

async fn run(runtime: Arc<ShellRuntime>, config: SandboxConfig, job: &JobAssignment) -> hypernode_agent::scheduler::JobExecutionRecord {
    let executor = JobExecutor::new(config, runtime);
    executor
        .execute(job, &reservation(job), &CancellationToken::new())
        .await
}

#[tokio::test]
async fn test_execute_completed_job() {
    let runtime = ShellRuntime::new();
    let job = JobAssignment::new("job-ok", "echo done");

    let record = run(runtime.clone(), sandbox(), &job).await;

    assert_eq!(record.job_id(), "job-ok");
    assert_eq!(record.status(), JobStatus::Completed);
    assert_eq!(record.exit_code(), Some(0));
    assert_eq!(record.logs(), "done\n");
    assert_eq!(record.execution_hash().len(), 64);
    assert_eq!(record.logs_hash().len(), 64);
    assert!(record.finished_at().is_some());
}

#[tokio::test]
async fn test_execute_nonzero_exit_fails() {
    let runtime = ShellRuntime::new();
    let job = JobAssignment::new("job-fail", "echo oops >&2\nexit 3");

    let record = run(runtime, sandbox(), &job).await;

    assert_eq!(record.status(), JobStatus::Failed);
    assert_eq!(record.exit_code(), Some(3));
    assert!(record.logs().contains("oops"));
}

#[tokio::test]
async fn test_execute_timeout_kills_job() {
    let runtime = ShellRuntime::new();
    let mut job = JobAssignment::new("job-slow", "exec sleep 30");
    job.timeout_seconds = Some(1);

    let started = Instant::now();
    let record = run(runtime.clone(), sandbox(), &job).await;

    assert_eq!(record.status(), JobStatus::TimedOut);
    assert_eq!(record.exit_code(), None);
    assert!(record.logs().contains("timeout"));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "timeout took {:?}",
        started.elapsed()
    );
    assert_eq!(runtime.killed().len(), 1);
    assert_eq!(runtime.removed(), runtime.spawned());
}

#[tokio::test]
async fn test_execute_large_output_is_truncated() {
    let runtime = ShellRuntime::new();
    let job = JobAssignment::new(
        "job-loud",
        "head -c 1048576 /dev/zero | tr '\\0' 'a'",
    );

    let record = run(runtime, sandbox(), &job).await;

    assert_eq!(record.status(), JobStatus::Completed);
    assert_eq!(record.logs().len(), 10_000);
    assert!(record.logs().ends_with(TRUNCATION_MARKER));
    assert!(record.logs().starts_with('a'));
}

#[tokio::test]
async fn test_execute_runtime_failure_is_reported_as_failed() {
    let runtime = ShellRuntime::failing();
    let job = JobAssignment::new("job-nort", "echo never");

    let record = run(runtime.clone(), sandbox(), &job).await;

    assert_eq!(record.status(), JobStatus::Failed);
    assert_eq!(record.exit_code(), None);
    assert!(record.logs().contains("could not be created"));
    assert_eq!(record.execution_hash().len(), 64);
    // Teardown still runs for a container that never started
    assert_eq!(runtime.removed().len(), 1);
}

#[tokio::test]
async fn test_execute_tears_down_on_every_path() {
    let runtime = ShellRuntime::new();

    run(runtime.clone(), sandbox(), &JobAssignment::new("a", "true")).await;
    run(runtime.clone(), sandbox(), &JobAssignment::new("b", "exit 1")).await;
    let mut slow = JobAssignment::new("c", "exec sleep 30");
    slow.timeout_seconds = Some(1);
    run(runtime.clone(), sandbox(), &slow).await;

    let spawned = runtime.spawned();
    assert_eq!(spawned.len(), 3);
    assert_eq!(runtime.removed(), spawned);
}

#[tokio::test]
async fn test_execute_cancelled_job_fails_with_marker() {
    let runtime = ShellRuntime::new();
    let executor = JobExecutor::new(sandbox(), runtime.clone());
    let job = JobAssignment::new("job-cancel", "exec sleep 30");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let record = executor.execute(&job, &reservation(&job), &cancel).await;

    assert_eq!(record.status(), JobStatus::Failed);
    assert!(record.logs().contains("cancelled"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(runtime.removed().len(), 1);
}

#[tokio::test]
async fn test_execute_rejects_unknown_dataset() {
    let runtime = ShellRuntime::new();
    let datasets = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        datasets_dir: Some(datasets.path().to_path_buf()),
        ..sandbox()
    };
    let mut job = JobAssignment::new("job-data", "echo never");
    job.datasets = vec!["../secrets".to_string()];

    let record = run(runtime.clone(), config, &job).await;

    assert_eq!(record.status(), JobStatus::Failed);
    assert!(record.logs().contains("dataset"));
    assert!(runtime.spawned().is_empty());
}

#[tokio::test]
async fn test_execute_has_writable_scratch_and_job_env() {
    let runtime = ShellRuntime::new();
    let work = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        work_dir: Some(work.path().to_path_buf()),
        ..sandbox()
    };
    let mut job = JobAssignment::new("job-env", "echo \"$JOB_ID\" > out.txt\ncat out.txt\necho \"$HN_DEPENDENCIES\"");
    job.dependencies = vec!["numpy".to_string(), "torch".to_string()];

    let record = run(runtime, config, &job).await;

    assert_eq!(record.status(), JobStatus::Completed);
    assert_eq!(record.logs(), "job-env\nnumpy,torch\n");
    // Workspace is removed after the job
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_execute_hashes_are_reproducible() {
    let runtime = ShellRuntime::new();
    let job = JobAssignment::new("job-hash", "echo same");

    let first = run(runtime.clone(), sandbox(), &job).await;
    let second = run(runtime, sandbox(), &job).await;

    assert_eq!(first.execution_hash(), second.execution_hash());
    assert_eq!(first.logs_hash(), second.logs_hash());
}
