use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::runner::{ContainerRunner, LogBuffer, RunOutcome};
use super::runtime::{container_name, ContainerRuntime, ContainerSpec, Mount};
use crate::config::SandboxConfig;
use crate::error::JobError;
use crate::scheduler::{JobAssignment, JobExecutionRecord, JobStatus, ResourceClass, Reservation};

/// File name of the job script inside the read-only `/job` mount.
pub const SCRIPT_FILE: &str = "script";

/// Host-side files for one job. Removed when dropped.
struct Workspace {
    root: TempDir,
    job_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl Workspace {
    async fn prepare(base: Option<&Path>, job: &JobAssignment) -> Result<Self, JobError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("hn-job-");
        let root = match base {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };

        let job_dir = root.path().join("job");
        let scratch_dir = root.path().join("scratch");
        tokio::fs::create_dir(&job_dir).await?;
        tokio::fs::create_dir(&scratch_dir).await?;
        tokio::fs::write(job_dir.join(SCRIPT_FILE), job.script.as_bytes()).await?;

        Ok(Self {
            root,
            job_dir,
            scratch_dir,
        })
    }

    fn cleanup(self, job_id: &str) {
        let path = self.root.path().to_path_buf();
        if let Err(e) = self.root.close() {
            tracing::warn!(job_id, path = %path.display(), error = %e, "Failed to remove job workspace");
        }
    }
}

/// Resolve dataset references to read-only mounts under `/data`.
pub fn dataset_mounts(datasets_dir: Option<&Path>, refs: &[String]) -> Result<Vec<Mount>, JobError> {
    if refs.is_empty() {
        return Ok(Vec::new());
    }
    let Some(root) = datasets_dir else {
        return Err(JobError::InvalidMount(
            "job references datasets but no datasets directory is configured".to_string(),
        ));
    };

    refs.iter()
        .map(|reference| {
            let relative = Path::new(reference);
            let well_formed = !reference.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !well_formed {
                return Err(JobError::InvalidMount(format!("{:?} is not a relative dataset path", reference)));
            }

            let host = root.join(relative);
            if !host.exists() {
                return Err(JobError::InvalidMount(format!("dataset {:?} not found", reference)));
            }
            Ok(Mount {
                host,
                container: format!("/data/{}", reference.trim_end_matches('/')),
                read_only: true,
            })
        })
        .collect()
}

/// Executes admitted jobs in sandboxed containers.
///
/// Every job gets its own container with:
/// - Network disabled
/// - Memory, CPU and process limits
/// - Dropped capabilities and a read-only root filesystem
/// - Its script and datasets mounted read-only, plus a private scratch area
///
/// Failures never escape: the returned record is always terminal.
pub struct JobExecutor {
    config: SandboxConfig,
    runner: ContainerRunner,
}

impl JobExecutor {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let runner = ContainerRunner::new(runtime, config.max_log_size, config.kill_grace);
        Self { config, runner }
    }

    pub async fn execute(
        &self,
        job: &JobAssignment,
        reservation: &Reservation,
        cancel: &CancellationToken,
    ) -> JobExecutionRecord {
        let mut record = JobExecutionRecord::new(&job.job_id);
        if let Err(e) = record.start() {
            tracing::error!(job_id = %job.job_id, error = %e, "Job record could not start");
        }

        let timeout = job.timeout(self.config.default_timeout);
        tracing::info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            class = %job.resource_type,
            gpu = ?reservation.gpu_device,
            timeout_secs = timeout.as_secs(),
            "Executing job"
        );

        let (status, exit_code, logs) = match self.run(job, reservation, cancel).await {
            Ok((RunOutcome::Exited(Some(0)), logs)) => (JobStatus::Completed, Some(0), logs),
            Ok((RunOutcome::Exited(code), logs)) => (JobStatus::Failed, code, logs),
            Ok((RunOutcome::TimedOut, logs)) => (JobStatus::TimedOut, None, logs),
            Ok((RunOutcome::Cancelled, logs)) => (JobStatus::Failed, None, logs),
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Job could not be started");
                let mut buffer = LogBuffer::new(self.config.max_log_size);
                buffer.push(format!("[hypernode: {}]", e).as_bytes());
                (JobStatus::Failed, None, buffer.finalize())
            }
        };

        if let Err(e) = record.finish(status, exit_code, logs) {
            tracing::error!(job_id = %job.job_id, error = %e, "Job record could not finish");
        }

        tracing::info!(
            job_id = %job.job_id,
            status = %record.status(),
            exit_code = ?record.exit_code(),
            duration_ms = record.duration().map(|d| d.num_milliseconds()),
            "Job finished"
        );
        record
    }

    async fn run(
        &self,
        job: &JobAssignment,
        reservation: &Reservation,
        cancel: &CancellationToken,
    ) -> Result<(RunOutcome, String), JobError> {
        let mounts = dataset_mounts(self.config.datasets_dir.as_deref(), &job.datasets)?;
        let workspace = Workspace::prepare(self.config.work_dir.as_deref(), job).await?;

        let spec = self.container_spec(job, reservation, &workspace, mounts);
        let result = self
            .runner
            .run(&spec, job.timeout(self.config.default_timeout), cancel)
            .await;

        workspace.cleanup(&job.job_id);
        let report = result?;
        Ok((report.outcome, report.logs))
    }

    fn container_spec(
        &self,
        job: &JobAssignment,
        reservation: &Reservation,
        workspace: &Workspace,
        mounts: Vec<Mount>,
    ) -> ContainerSpec {
        let image = match job.resource_type {
            ResourceClass::Cpu => self.config.cpu_image.clone(),
            ResourceClass::Gpu => self.config.gpu_image.clone(),
        };
        let cpus = if reservation.cpu_millis > 0 {
            reservation.cpu_millis as f64 / 1000.0
        } else {
            job.cpu_limit.filter(|c| *c > 0.0).unwrap_or(self.config.cpu_limit)
        };

        let mut env = vec![
            ("JOB_ID".to_string(), job.job_id.clone()),
            ("JOB_TYPE".to_string(), job.job_type.clone()),
        ];
        if !job.dependencies.is_empty() {
            env.push(("HN_DEPENDENCIES".to_string(), job.dependencies.join(",")));
        }

        ContainerSpec {
            name: container_name(&job.job_id),
            image,
            interpreter: self.config.interpreter_for(job.resource_type).to_string(),
            workspace: workspace.job_dir.clone(),
            script_file: SCRIPT_FILE.to_string(),
            scratch: workspace.scratch_dir.clone(),
            mounts,
            env,
            memory_limit: job
                .memory_limit
                .clone()
                .unwrap_or_else(|| self.config.memory_limit.clone()),
            cpus,
            pids_limit: self.config.pids_limit,
            gpu_device: reservation.gpu_device,
        }
    }
}
