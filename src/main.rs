use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use hypernode_agent::agent::Agent;
use hypernode_agent::config::{AgentConfig, CapacityConfig, ConnectionConfig, SandboxConfig};
use hypernode_agent::error::AgentError;
use hypernode_agent::identity::{self, NodeIdentity};
use hypernode_agent::shutdown::install_shutdown_handler;
use hypernode_agent::worker::{ContainerRuntime, DockerCli};

#[derive(Parser, Debug)]
#[command(name = "hypernode-agent")]
#[command(version)]
#[command(about = "Compute node agent: runs sandboxed jobs assigned by a control server")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Connect to the control server and execute assigned jobs
    Run(RunArgs),

    /// Check that the agent could start on this host
    Healthcheck(HealthcheckArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Control server endpoint (wss://host/path)
    #[arg(long, env = "HN_ENDPOINT")]
    endpoint: String,

    /// Registration token
    #[arg(long, env = "HN_NODE_TOKEN", hide_env_values = true)]
    token: String,

    /// Accept a plaintext ws:// endpoint
    #[arg(long, env = "HN_ALLOW_INSECURE")]
    allow_insecure: bool,

    /// Heartbeat interval in seconds
    #[arg(long, env = "HN_HEARTBEAT_INTERVAL", default_value = "10")]
    heartbeat_interval: u64,

    /// Timeout in seconds for jobs that do not specify one
    #[arg(long, env = "HN_JOB_TIMEOUT", default_value = "300")]
    job_timeout: u64,

    /// Maximum reported log size in bytes
    #[arg(long, env = "HN_MAX_LOG_SIZE", default_value = "10000")]
    max_log_size: usize,

    /// First reconnect delay in seconds
    #[arg(long, env = "HN_RECONNECT_DELAY", default_value = "5")]
    reconnect_delay: u64,

    /// Reconnect delay cap in seconds
    #[arg(long, env = "HN_RECONNECT_MAX_DELAY", default_value = "60")]
    reconnect_max_delay: u64,

    /// Fraction of each reconnect delay removed at random (0.0 - 1.0)
    #[arg(long, env = "HN_RECONNECT_JITTER", default_value = "0.2")]
    reconnect_jitter: f64,

    /// Connect and registration timeout in seconds
    #[arg(long, env = "HN_HANDSHAKE_TIMEOUT", default_value = "10")]
    handshake_timeout: u64,

    /// Jobs allowed to run at the same time
    #[arg(long, env = "HN_MAX_CONCURRENT_JOBS", default_value = "4")]
    max_concurrent_jobs: usize,

    /// Jobs allowed to wait for capacity
    #[arg(long, env = "HN_MAX_QUEUED_JOBS", default_value = "16")]
    max_queued_jobs: usize,

    /// CPU cores available to jobs (defaults to the detected core count)
    #[arg(long, env = "HN_CPU_BUDGET")]
    cpu_budget: Option<f64>,

    /// Outbound frame queue capacity
    #[arg(long, env = "HN_OUTBOUND_BUFFER", default_value = "256")]
    outbound_buffer: usize,

    /// Seconds running jobs may continue after a shutdown signal
    #[arg(long, env = "HN_SHUTDOWN_GRACE", default_value = "30")]
    shutdown_grace: u64,

    /// Seconds to wait for buffered results to flush on shutdown
    #[arg(long, env = "HN_SHUTDOWN_FLUSH_TIMEOUT", default_value = "10")]
    shutdown_flush_timeout: u64,

    #[command(flatten)]
    sandbox: SandboxArgs,

    /// Port for the local status endpoint (disabled if unset)
    #[arg(long, env = "HN_STATUS_PORT")]
    status_port: Option<u16>,
}

// =============================================================================
// Sandbox Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct SandboxArgs {
    /// Container runtime CLI
    #[arg(long, env = "HN_RUNTIME_BIN", default_value = "docker")]
    runtime_bin: String,

    /// Image for CPU jobs
    #[arg(long, env = "HN_CPU_IMAGE", default_value = "python:3.11-slim")]
    cpu_image: String,

    /// Image for GPU jobs; must provide the GPU interpreter
    #[arg(
        long,
        env = "HN_GPU_IMAGE",
        default_value = "nvidia/cuda:12.0.0-runtime-ubuntu22.04"
    )]
    gpu_image: String,

    /// Interpreter that runs the job script inside the container
    #[arg(long, env = "HN_INTERPRETER", default_value = "python3")]
    interpreter: String,

    /// Interpreter for GPU jobs (defaults to --interpreter)
    #[arg(long, env = "HN_GPU_INTERPRETER")]
    gpu_interpreter: Option<String>,

    /// Default per-job memory limit
    #[arg(long, env = "HN_JOB_MEMORY", default_value = "8g")]
    job_memory: String,

    /// Default per-job CPU limit in cores
    #[arg(long, env = "HN_JOB_CPUS", default_value = "2.0")]
    job_cpus: f64,

    /// Host directory dataset references resolve against
    #[arg(long, env = "HN_DATASETS_DIR")]
    datasets_dir: Option<PathBuf>,

    /// Host directory for per-job workspaces
    #[arg(long, env = "HN_WORK_DIR")]
    work_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct HealthcheckArgs {
    #[arg(long, env = "HN_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "HN_NODE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "HN_RUNTIME_BIN", default_value = "docker")]
    runtime_bin: String,
}

// =============================================================================
// Configuration
// =============================================================================

fn build_config(args: RunArgs) -> AgentConfig {
    let defaults = AgentConfig::default();
    let sandbox = SandboxConfig {
        runtime_bin: args.sandbox.runtime_bin,
        cpu_image: args.sandbox.cpu_image,
        gpu_image: args.sandbox.gpu_image,
        interpreter: args.sandbox.interpreter,
        gpu_interpreter: args.sandbox.gpu_interpreter,
        memory_limit: args.sandbox.job_memory,
        cpu_limit: args.sandbox.job_cpus,
        datasets_dir: args.sandbox.datasets_dir,
        work_dir: args.sandbox.work_dir,
        default_timeout: Duration::from_secs(args.job_timeout),
        max_log_size: args.max_log_size,
        ..defaults.sandbox
    };

    AgentConfig {
        token: args.token,
        connection: ConnectionConfig {
            endpoint: args.endpoint,
            allow_insecure: args.allow_insecure,
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            reconnect_base_delay: Duration::from_secs(args.reconnect_delay),
            reconnect_max_delay: Duration::from_secs(args.reconnect_max_delay),
            reconnect_jitter: args.reconnect_jitter,
            outbound_buffer: args.outbound_buffer,
        },
        capacity: CapacityConfig {
            max_concurrent_jobs: args.max_concurrent_jobs,
            max_queued_jobs: args.max_queued_jobs,
            cpu_budget: args.cpu_budget.unwrap_or(defaults.capacity.cpu_budget),
            gpu_devices: Vec::new(),
        },
        sandbox,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        shutdown_grace: Duration::from_secs(args.shutdown_grace),
        shutdown_flush_timeout: Duration::from_secs(args.shutdown_flush_timeout),
        status_port: args.status_port,
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_agent(args: RunArgs) -> Result<(), AgentError> {
    let mut config = build_config(args);
    config.validate()?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(&config.sandbox.runtime_bin));
    let runtime_version = runtime.ping().await?;
    tracing::info!(runtime = %config.sandbox.runtime_bin, version = %runtime_version, "Container runtime available");

    let host_info = identity::discover_host(Some(runtime_version)).await;
    config.capacity.gpu_devices = host_info.gpus.iter().map(|g| g.index).collect();
    let identity = Arc::new(NodeIdentity::new(config.token.clone(), host_info));

    let shutdown = install_shutdown_handler()?;
    Agent::new(config, runtime, identity).run(shutdown).await
}

async fn healthcheck(args: HealthcheckArgs) -> bool {
    let mut healthy = true;

    if args.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
        eprintln!("HN_ENDPOINT is not set");
        healthy = false;
    }
    if args.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
        eprintln!("HN_NODE_TOKEN is not set");
        healthy = false;
    }

    match DockerCli::new(args.runtime_bin).ping().await {
        Ok(version) => println!("container runtime OK ({})", version),
        Err(e) => {
            eprintln!("container runtime unavailable: {}", e);
            healthy = false;
        }
    }
    healthy
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();

            match run_agent(run_args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "Agent exited with error");
                    ExitCode::from(e.exit_code())
                }
            }
        }
        Commands::Healthcheck(check_args) => {
            if healthcheck(check_args).await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
