use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;
use crate::worker::runtime::RuntimeError;

/// Top-level agent failure. Only these ever end the process.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Registration rejected by server: {0}")]
    RegistrationRejected(String),

    #[error("Container runtime unavailable: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            AgentError::RegistrationRejected(_) => 2,
            _ => 1,
        }
    }
}

/// Transient control-channel failure. Always recovered by reconnecting.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connect failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("No registration acknowledgment within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Connection closed by server")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Heartbeat send failed: {0}")]
    HeartbeatSend(String),
}

/// Job-level failure. Converted into a `Failed` record, never propagated.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Container creation failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Invalid dataset reference: {0}")]
    InvalidMount(String),

    #[error("Failed to prepare job workspace: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Failure to enqueue an outbound frame.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection manager has shut down")]
    Closed,

    #[error("Outbound queue is full")]
    Full,
}

pub type Result<T> = std::result::Result<T, AgentError>;
