//! Registration handshake, run once per established connection.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ConnectionError;
use crate::identity::NodeIdentity;
use crate::protocol::{AgentMessage, ProtocolError, ServerMessage};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The server refused the token. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Anything else; handled like a dropped connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Send the registration request and wait for `registered` or `error`.
///
/// The whole exchange, send included, must finish within `deadline`.
/// Returns the node id assigned by the server.
pub async fn register<S>(
    ws: &mut S,
    identity: &NodeIdentity,
    deadline: Duration,
) -> Result<String, RegistrationError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    match tokio::time::timeout(deadline, exchange(ws, identity)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::HandshakeTimeout(deadline).into()),
    }
}

async fn exchange<S>(ws: &mut S, identity: &NodeIdentity) -> Result<String, RegistrationError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let request = identity
        .register_message()
        .to_text()
        .map_err(|e| ConnectionError::Protocol(ProtocolError::Malformed(e)))?;
    ws.send(Message::text(request))
        .await
        .map_err(ConnectionError::Transport)?;

    tracing::info!(
        hostname = %identity.host_info().hostname,
        gpus = identity.gpus().len(),
        "Registration request sent"
    );

    await_ack(ws).await
}

async fn await_ack<S>(ws: &mut S) -> Result<String, RegistrationError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    while let Some(frame) = ws.next().await {
        let text = match frame.map_err(ConnectionError::Transport)? {
            Message::Text(text) => text,
            Message::Binary(_) => return Err(ConnectionError::Protocol(ProtocolError::BinaryFrame).into()),
            Message::Close(_) => return Err(ConnectionError::Closed.into()),
            _ => continue,
        };

        match ServerMessage::parse(text.as_str()).map_err(ConnectionError::Protocol)? {
            ServerMessage::Registered { node_id } => return Ok(node_id),
            ServerMessage::Error { message } => return Err(RegistrationError::Rejected(message)),
            ServerMessage::Ping => {
                let pong = AgentMessage::Pong
                    .to_text()
                    .map_err(|e| ConnectionError::Protocol(ProtocolError::Malformed(e)))?;
                ws.send(Message::text(pong))
                    .await
                    .map_err(ConnectionError::Transport)?;
            }
            ServerMessage::Ack => {}
            other => {
                tracing::warn!(kind = other.kind(), "Dropping message received before registration completed");
            }
        }
    }
    Err(ConnectionError::Closed.into())
}
