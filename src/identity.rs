use std::sync::OnceLock;

use sysinfo::{System, SystemExt};

use crate::gpu::{self, GpuDescriptor};
use crate::protocol::{AgentMessage, HostInfo};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Who this agent is to the control server.
///
/// Everything except the assigned node id is fixed at startup. The node id
/// is set by the first successful registration and never changes afterwards.
#[derive(Debug)]
pub struct NodeIdentity {
    token: String,
    host_info: HostInfo,
    node_id: OnceLock<String>,
}

impl NodeIdentity {
    pub fn new(token: impl Into<String>, host_info: HostInfo) -> Self {
        Self {
            token: token.into(),
            host_info,
            node_id: OnceLock::new(),
        }
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.host_info
    }

    pub fn gpus(&self) -> &[GpuDescriptor] {
        &self.host_info.gpus
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.get().map(String::as_str)
    }

    /// Record the id from a `registered` ack. A later ack carrying a
    /// different id does not replace the first one.
    pub fn assign(&self, node_id: &str) {
        match self.node_id.get() {
            None => {
                let _ = self.node_id.set(node_id.to_string());
            }
            Some(existing) if existing != node_id => {
                tracing::warn!(
                    node_id = %existing,
                    offered = %node_id,
                    "Server assigned a different node id on re-registration, keeping the original"
                );
            }
            Some(_) => {}
        }
    }

    pub fn register_message(&self) -> AgentMessage {
        AgentMessage::Register {
            token: self.token.clone(),
            host_info: self.host_info.clone(),
        }
    }
}

/// Collect host capabilities for registration.
pub async fn discover_host(runtime_version: Option<String>) -> HostInfo {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    HostInfo {
        hostname,
        os: std::env::consts::OS.to_string(),
        os_version: sys.os_version(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: sys.cpus().len(),
        memory_bytes: sys.total_memory(),
        gpus: gpu::detect_gpus().await,
        runtime_version,
        agent_version: AGENT_VERSION.to_string(),
    }
}
