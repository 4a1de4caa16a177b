use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime binary could not be started: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("runtime command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("container could not be created: {0}")]
    CreateFailed(String),
}

/// Mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to start one sandboxed job container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub interpreter: String,
    /// Host directory holding the job script, mounted read-only at `/job`
    pub workspace: PathBuf,
    pub script_file: String,
    /// Writable scratch directory, mounted at `/scratch` and used as cwd
    pub scratch: PathBuf,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub memory_limit: String,
    pub cpus: f64,
    pub pids_limit: u32,
    pub gpu_device: Option<u32>,
}

/// A started container whose output is still being produced.
#[derive(Debug)]
pub struct RunningContainer {
    pub name: String,
    pub child: Child,
}

/// Seam between job execution and the container engine.
///
/// The production implementation shells out to the Docker CLI; tests plug in
/// a process-backed fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check the runtime is reachable, returning its version.
    async fn ping(&self) -> Result<String, RuntimeError>;

    /// Start a container with stdout and stderr piped.
    async fn spawn(&self, spec: &ContainerSpec) -> Result<RunningContainer, RuntimeError>;

    async fn kill(&self, name: &str) -> Result<(), RuntimeError>;

    /// Remove the container. Must succeed for containers that already exited.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
}

/// Container runtime driven through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments for `docker run`, in the order they are passed.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];

        args.push("--network=none".to_string());
        args.push(format!("--memory={}", spec.memory_limit));
        args.push(format!("--cpus={}", spec.cpus));
        args.push(format!("--pids-limit={}", spec.pids_limit));

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        // Read-only root filesystem with a private /tmp
        args.push("--read-only".to_string());
        args.push("--tmpfs".to_string());
        args.push("/tmp:rw,noexec,nosuid,size=64m".to_string());

        args.push("-v".to_string());
        args.push(format!("{}:/job:ro", spec.workspace.display()));
        for mount in &spec.mounts {
            args.push("-v".to_string());
            let mode = if mount.read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", mount.host.display(), mount.container, mode));
        }
        args.push("-v".to_string());
        args.push(format!("{}:/scratch", spec.scratch.display()));
        args.push("-w".to_string());
        args.push("/scratch".to_string());

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(device) = spec.gpu_device {
            args.push(format!("--gpus=device={}", device));
        }

        args.push(spec.image.clone());
        args.push(spec.interpreter.clone());
        args.push(format!("/job/{}", spec.script_file));
        args
    }

    async fn command(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(RuntimeError::Unavailable)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<String, RuntimeError> {
        self.command(&["version", "--format", "{{.Server.Version}}"]).await
    }

    async fn spawn(&self, spec: &ContainerSpec) -> Result<RunningContainer, RuntimeError> {
        tracing::debug!(container = %spec.name, image = %spec.image, "Starting container");

        let child = Command::new(&self.binary)
            .args(Self::run_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RuntimeError::Unavailable)?;

        Ok(RunningContainer {
            name: spec.name.clone(),
            child,
        })
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.command(&["kill", name]).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.command(&["rm", "-f", name]).await.map(|_| ())
    }
}

/// Unique container name for a job. Characters the runtime rejects in names
/// are replaced.
pub fn container_name(job_id: &str) -> String {
    let sanitized: String = job_id
        .chars()
        .take(40)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("hn-job-{}-{}", sanitized, &suffix[..8])
}
