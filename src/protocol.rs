//! Control-channel wire protocol.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Inbound
//! frames decode into [`ServerMessage`], outbound frames are built from
//! [`AgentMessage`]. Anything that does not decode into a known kind is a
//! [`ProtocolError`] and is rejected rather than ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::gpu::GpuDescriptor;
use crate::scheduler::{JobAssignment, JobStatus};
use crate::stats::StatsSnapshot;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Frame has no string `type` field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid `{kind}` message: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Binary frames are not part of the protocol")]
    BinaryFrame,
}

/// Messages sent by the control server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Registration acknowledgment carrying the assigned node id
    Registered {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// Job assignment
    Job(JobAssignment),
    /// Server-side error; during registration this is a rejection
    Error {
        #[serde(default)]
        message: String,
    },
    /// Application-level liveness probe, answered with `pong`
    Ping,
    /// Heartbeat acknowledgment
    Ack,
    /// Request to abandon a queued or running job
    #[serde(alias = "job_cancel")]
    JobCancel {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

const SERVER_KINDS: &[&str] = &[
    "registered",
    "job",
    "error",
    "ping",
    "ack",
    "jobCancel",
    "job_cancel",
];

impl ServerMessage {
    /// Decode one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !SERVER_KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidFields { kind, source })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::Job(_) => "job",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Ping => "ping",
            ServerMessage::Ack => "ack",
            ServerMessage::JobCancel { .. } => "jobCancel",
        }
    }
}

/// Host capabilities sent with the registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: Option<String>,
    pub arch: String,
    pub cpu_count: usize,
    pub memory_bytes: u64,
    pub gpus: Vec<GpuDescriptor>,
    pub runtime_version: Option<String>,
    pub agent_version: String,
}

/// Output section of a `jobResult` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub logs: String,
    pub exit_code: Option<i32>,
    pub execution_hash: String,
    pub logs_hash: String,
}

/// Messages sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    Register {
        token: String,
        #[serde(rename = "hostInfo")]
        host_info: HostInfo,
    },
    Heartbeat {
        #[serde(rename = "nodeId")]
        node_id: String,
        timestamp: DateTime<Utc>,
        stats: StatsSnapshot,
    },
    JobResult {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        status: JobStatus,
        result: JobOutput,
    },
    JobRejected {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        reason: String,
    },
    Pong,
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Register { .. } => "register",
            AgentMessage::Heartbeat { .. } => "heartbeat",
            AgentMessage::JobResult { .. } => "jobResult",
            AgentMessage::JobRejected { .. } => "jobRejected",
            AgentMessage::Pong => "pong",
        }
    }

    /// Whether the frame must survive a reconnect. Heartbeats and pongs are
    /// only meaningful on the connection they were produced for.
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            AgentMessage::JobResult { .. } | AgentMessage::JobRejected { .. }
        )
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
