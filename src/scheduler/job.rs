use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a job needs a GPU or only CPU time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    #[default]
    Cpu,
    Gpu,
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClass::Cpu => write!(f, "cpu"),
            ResourceClass::Gpu => write!(f, "gpu"),
        }
    }
}

/// A job as assigned by the control server. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAssignment {
    #[serde(alias = "id")]
    pub job_id: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub resource_type: ResourceClass,
    /// Script content, written into the job workspace and run by the interpreter
    pub script: String,
    /// Dataset references, relative to the agent's datasets directory
    #[serde(default, alias = "datasetRefs")]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

impl JobAssignment {
    pub fn new(job_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: String::new(),
            resource_type: ResourceClass::Cpu,
            script: script.into(),
            datasets: Vec::new(),
            dependencies: Vec::new(),
            timeout_seconds: None,
            memory_limit: None,
            cpu_limit: None,
        }
    }

    /// Effective wall-clock limit, falling back to the agent default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Execution record for one admitted job.
///
/// Moves `Pending -> Running -> {Completed, Failed, TimedOut}`. Once terminal
/// the record cannot change; the proof hashes are attached at that point.
#[derive(Debug, Clone)]
pub struct JobExecutionRecord {
    job_id: String,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    logs: String,
    execution_hash: String,
    logs_hash: String,
}

impl JobExecutionRecord {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            exit_code: None,
            logs: String::new(),
            execution_hash: String::new(),
            logs_hash: String::new(),
        }
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Pending {
            return Err(InvalidTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record the terminal outcome. Hashes are computed over the final
    /// status, exit code and (already truncated) logs.
    pub fn finish(
        &mut self,
        status: JobStatus,
        exit_code: Option<i32>,
        logs: String,
    ) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Running || !status.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        let proof = crate::worker::proof::generate(&self.job_id, status, exit_code, logs.as_bytes());
        self.status = status;
        self.exit_code = exit_code;
        self.logs = logs;
        self.execution_hash = proof.execution_hash;
        self.logs_hash = proof.logs_hash;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn logs(&self) -> &str {
        &self.logs
    }

    pub fn execution_hash(&self) -> &str {
        &self.execution_hash
    }

    pub fn logs_hash(&self) -> &str {
        &self.logs_hash
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}
