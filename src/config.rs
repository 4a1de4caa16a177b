use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::AgentError;
use crate::scheduler::ResourceClass;

/// Configuration for container-based job execution.
///
/// Every job runs in its own container with:
/// - Network disabled
/// - Memory and CPU limits
/// - Dropped capabilities and a read-only root filesystem
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container runtime CLI binary
    pub runtime_bin: String,
    /// Image for CPU-class jobs
    pub cpu_image: String,
    /// Image for GPU-class jobs. Must provide the GPU interpreter; the stock
    /// CUDA runtime image ships without Python.
    pub gpu_image: String,
    /// Interpreter used to run the job script inside the container
    pub interpreter: String,
    /// Interpreter for GPU-class jobs, `interpreter` when unset
    pub gpu_interpreter: Option<String>,
    /// Default memory limit when the job does not specify one (e.g. "8g")
    pub memory_limit: String,
    /// Default CPU limit in cores when the job does not specify one
    pub cpu_limit: f64,
    /// Maximum number of processes inside the container
    pub pids_limit: u32,
    /// Host directory that dataset references resolve against
    pub datasets_dir: Option<PathBuf>,
    /// Host directory for per-job workspaces (system temp dir if unset)
    pub work_dir: Option<PathBuf>,
    /// Timeout applied when a job does not carry its own
    pub default_timeout: Duration,
    /// Maximum size of the reported log, in bytes
    pub max_log_size: usize,
    /// How long to wait for a killed container to exit
    pub kill_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            cpu_image: "python:3.11-slim".to_string(),
            gpu_image: "nvidia/cuda:12.0.0-runtime-ubuntu22.04".to_string(),
            interpreter: "python3".to_string(),
            gpu_interpreter: None,
            memory_limit: "8g".to_string(),
            cpu_limit: 2.0,
            pids_limit: 512,
            datasets_dir: None,
            work_dir: None,
            default_timeout: Duration::from_secs(300),
            max_log_size: 10_000,
            kill_grace: Duration::from_secs(10),
        }
    }
}

impl SandboxConfig {
    /// Interpreter that runs scripts of the given resource class.
    pub fn interpreter_for(&self, class: ResourceClass) -> &str {
        match (class, &self.gpu_interpreter) {
            (ResourceClass::Gpu, Some(gpu)) => gpu,
            _ => &self.interpreter,
        }
    }
}

/// Control-channel connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Control server endpoint (`wss://...`)
    pub endpoint: String,
    /// Accept a plaintext `ws://` endpoint.
    pub allow_insecure: bool,
    /// Deadline for the TCP/TLS/WebSocket connect and for the registration ack
    pub handshake_timeout: Duration,
    /// First reconnect delay
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
    /// Fraction of each delay that may be shaved off at random (0.0 - 1.0)
    pub reconnect_jitter: f64,
    /// Capacity of the outbound frame queue
    pub outbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            allow_insecure: false,
            handshake_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_jitter: 0.2,
            outbound_buffer: 256,
        }
    }
}

impl ConnectionConfig {
    /// Parse and check the endpoint URL.
    pub fn endpoint_url(&self) -> Result<Url, AgentError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| AgentError::Config(format!("malformed endpoint {:?}: {}", self.endpoint, e)))?;

        match url.scheme() {
            "wss" => Ok(url),
            "ws" if self.allow_insecure => {
                tracing::warn!(endpoint = %url, "Using plaintext control channel");
                Ok(url)
            }
            "ws" => Err(AgentError::Config(
                "endpoint uses ws:// without --allow-insecure".to_string(),
            )),
            other => Err(AgentError::Config(format!(
                "endpoint must use ws:// or wss:// scheme, got: {}",
                other
            ))),
        }
    }
}

/// Local capacity available to admission control.
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    /// Hard cap on concurrently running jobs, across resource classes
    pub max_concurrent_jobs: usize,
    /// Jobs waiting beyond this bound are rejected
    pub max_queued_jobs: usize,
    /// CPU cores available to CPU-class jobs
    pub cpu_budget: f64,
    /// GPU device indices available to GPU-class jobs
    pub gpu_devices: Vec<u32>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_queued_jobs: 16,
            cpu_budget: std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0),
            gpu_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Registration token
    pub token: String,
    pub connection: ConnectionConfig,
    pub capacity: CapacityConfig,
    pub sandbox: SandboxConfig,
    pub heartbeat_interval: Duration,
    /// How long running jobs may continue after a shutdown signal
    pub shutdown_grace: Duration,
    /// How long to wait for buffered results to flush before closing
    pub shutdown_flush_timeout: Duration,
    /// Port for the local status endpoint
    pub status_port: Option<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            connection: ConnectionConfig::default(),
            capacity: CapacityConfig::default(),
            sandbox: SandboxConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            shutdown_flush_timeout: Duration::from_secs(10),
            status_port: None,
        }
    }
}

impl AgentConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            connection: ConnectionConfig {
                endpoint: endpoint.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject configurations the agent cannot start with.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.token.trim().is_empty() {
            return Err(AgentError::Config("registration token is required".to_string()));
        }
        self.connection.endpoint_url()?;

        if self.heartbeat_interval.is_zero() {
            return Err(AgentError::Config("heartbeat interval must be positive".to_string()));
        }
        if self.connection.reconnect_base_delay > self.connection.reconnect_max_delay {
            return Err(AgentError::Config(
                "reconnect base delay exceeds the maximum delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.connection.reconnect_jitter) {
            return Err(AgentError::Config("reconnect jitter must be within 0.0..=1.0".to_string()));
        }
        if self.connection.outbound_buffer == 0 {
            return Err(AgentError::Config("outbound buffer must hold at least one frame".to_string()));
        }
        if self.capacity.max_concurrent_jobs == 0 {
            return Err(AgentError::Config("max concurrent jobs must be at least 1".to_string()));
        }
        if self.capacity.cpu_budget <= 0.0 {
            return Err(AgentError::Config("CPU budget must be positive".to_string()));
        }
        if self.sandbox.cpu_limit <= 0.0 {
            return Err(AgentError::Config("default job CPU limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Token prefix safe to print in logs.
    pub fn redacted_token(&self) -> String {
        let prefix: String = self.token.chars().take(8).collect();
        format!("{}...", prefix)
    }
}
