//! Control-channel connection management.
//!
//! The [`ConnectionManager`] owns the single WebSocket to the control server
//! and is the only writer of [`ConnectionState`]. It:
//! - **Connects** with a per-attempt deadline and runs the registration
//!   handshake on every new connection
//! - **Serializes outbound frames** from one ordered queue, so heartbeats and
//!   job results never interleave mid-frame
//! - **Demultiplexes inbound frames** into typed [`ServerMessage`]s
//! - **Reconnects** with [`ExponentialBackoff`] until closed
//!
//! Other components talk to it through a cloneable [`ConnectionHandle`].
//! Reliable frames (job results, rejections) wait in the bounded queue while
//! the connection is down and are flushed oldest first once registration
//! succeeds again. Heartbeats and pongs produced for an earlier connection are
//! discarded instead of being replayed. Closing while disconnected keeps
//! reconnecting until the flush timeout so pending results still go out.

pub mod backoff;
pub mod registration;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ConnectionConfig;
use crate::error::{AgentError, ConnectionError, SendError};
use crate::identity::NodeIdentity;
use crate::protocol::{AgentMessage, ServerMessage};

pub use backoff::{ExponentialBackoff, Jitter};
use registration::RegistrationError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Reconnecting,
    ShuttingDown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Registered => "registered",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct OutboundFrame {
    /// Connection epoch the frame was produced for
    epoch: u64,
    message: AgentMessage,
}

/// Cloneable sending side of the control channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    state: watch::Receiver<ConnectionState>,
    epoch: Arc<AtomicU64>,
    close: CancellationToken,
}

impl ConnectionHandle {
    fn frame(&self, message: AgentMessage) -> OutboundFrame {
        OutboundFrame {
            epoch: self.epoch.load(Ordering::Acquire),
            message,
        }
    }

    /// Queue a frame, waiting for space if the queue is full.
    pub async fn send(&self, message: AgentMessage) -> Result<(), SendError> {
        if self.close.is_cancelled() {
            return Err(SendError::Closed);
        }
        let frame = self.frame(message);
        tokio::select! {
            result = self.outbound.send(frame) => result.map_err(|_| SendError::Closed),
            _ = self.close.cancelled() => Err(SendError::Closed),
        }
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, message: AgentMessage) -> Result<(), SendError> {
        if self.close.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound
            .try_send(self.frame(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the manager to flush queued frames, close the socket and stop.
    pub fn close(&self) {
        self.close.cancel();
    }
}

enum SessionEnd {
    Closed,
    Lost(ConnectionError),
}

pub struct ConnectionManager {
    url: Url,
    config: ConnectionConfig,
    identity: Arc<NodeIdentity>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    inbound_tx: mpsc::Sender<ServerMessage>,
    /// Reliable frames whose write failed, replayed first on the next connection
    retry: VecDeque<AgentMessage>,
    epoch: Arc<AtomicU64>,
    close: CancellationToken,
    flush_timeout: Duration,
    backoff: ExponentialBackoff,
}

impl ConnectionManager {
    /// Build the manager, its handle, and the inbound message stream.
    pub fn new(
        url: Url,
        config: ConnectionConfig,
        identity: Arc<NodeIdentity>,
        flush_timeout: Duration,
    ) -> (Self, ConnectionHandle, ReceiverStream<ServerMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let epoch = Arc::new(AtomicU64::new(0));
        let close = CancellationToken::new();

        let jitter = if config.reconnect_jitter > 0.0 {
            Jitter::Proportional(config.reconnect_jitter)
        } else {
            Jitter::None
        };
        let backoff = ExponentialBackoff::new(config.reconnect_base_delay, config.reconnect_max_delay)
            .with_jitter(jitter);

        let handle = ConnectionHandle {
            outbound: outbound_tx,
            state: state_rx,
            epoch: epoch.clone(),
            close: close.clone(),
        };

        let manager = Self {
            url,
            config,
            identity,
            state_tx,
            outbound_rx,
            inbound_tx,
            retry: VecDeque::new(),
            epoch,
            close,
            flush_timeout,
            backoff,
        };

        (manager, handle, ReceiverStream::new(inbound_rx))
    }

    fn set_state(&self, state: ConnectionState) {
        // ShuttingDown is terminal for observers, even while a final flush
        // is still reconnecting
        if *self.state_tx.borrow() == ConnectionState::ShuttingDown {
            return;
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Drive the connection until closed or the token is rejected.
    ///
    /// Returns `Err(AgentError::RegistrationRejected)` when the server refuses
    /// the token; every other failure is retried.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let result = self.run_loop().await;
        self.set_state(ConnectionState::ShuttingDown);
        if result.is_ok() {
            self.report_unflushed();
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), AgentError> {
        // Set once close is requested with reliable frames still undelivered
        let mut flush_deadline: Option<Instant> = None;

        loop {
            if self.close.is_cancelled() && flush_deadline.is_none() {
                match self.begin_final_flush() {
                    Some(deadline) => flush_deadline = Some(deadline),
                    None => return Ok(()),
                }
            }

            self.set_state(ConnectionState::Connecting);
            let attempt = match flush_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.establish()).await {
                    Ok(result) => result,
                    Err(_) => return Ok(()),
                },
                None => {
                    let close = self.close.clone();
                    tokio::select! {
                        result = self.establish() => result,
                        _ = close.cancelled() => continue,
                    }
                }
            };

            let failure = match attempt {
                Ok((ws, node_id)) => {
                    self.identity.assign(&node_id);
                    let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                    self.backoff.reset();
                    self.set_state(ConnectionState::Registered);
                    tracing::info!(node_id = %node_id, epoch, "Registered with control server");

                    match self.session(ws, epoch).await {
                        SessionEnd::Closed => return Ok(()),
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(RegistrationError::Rejected(message)) => {
                    tracing::error!(reason = %message, "Registration rejected, not retrying");
                    return Err(AgentError::RegistrationRejected(message));
                }
                Err(RegistrationError::Connection(e)) => e,
            };

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            tracing::warn!(
                error = %failure,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Control connection failed, retrying"
            );

            match flush_deadline {
                Some(deadline) => {
                    let wake = Instant::now() + delay;
                    if wake >= deadline {
                        return Ok(());
                    }
                    tokio::time::sleep_until(wake).await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.close.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Move queued reliable frames into the retry buffer. Returns the
    /// deadline for delivering them, or `None` when nothing is pending.
    fn begin_final_flush(&mut self) -> Option<Instant> {
        while let Ok(frame) = self.outbound_rx.try_recv() {
            if frame.message.is_reliable() {
                self.retry.push_back(frame.message);
            }
        }
        if self.retry.is_empty() {
            return None;
        }
        self.set_state(ConnectionState::ShuttingDown);
        tracing::info!(
            frames = self.retry.len(),
            timeout_ms = self.flush_timeout.as_millis() as u64,
            "Closing while disconnected, reconnecting to deliver queued frames"
        );
        Some(Instant::now() + self.flush_timeout)
    }

    /// Open the socket and complete registration.
    async fn establish(&mut self) -> Result<(WsStream, String), RegistrationError> {
        let mut ws = self.connect().await?;
        self.set_state(ConnectionState::Connected);

        match registration::register(&mut ws, &self.identity, self.config.handshake_timeout).await {
            Ok(node_id) => Ok((ws, node_id)),
            Err(e) => {
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    /// One connect attempt, bounded by the handshake timeout.
    pub async fn connect(&self) -> Result<WsStream, ConnectionError> {
        tracing::debug!(endpoint = %self.url, "Connecting to control server");
        let deadline = self.config.handshake_timeout;
        match tokio::time::timeout(deadline, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(ConnectionError::Connect(e)),
            Err(_) => Err(ConnectionError::ConnectTimeout(deadline)),
        }
    }

    async fn session(&mut self, ws: WsStream, epoch: u64) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        while let Some(message) = self.retry.pop_front() {
            if let Err(e) = write(&mut sink, &message).await {
                self.retry.push_front(message);
                return SessionEnd::Lost(e);
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = self.close.cancelled() => {
                    self.flush_and_close(sink, epoch).await;
                    return SessionEnd::Closed;
                }

                frame = self.outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        self.flush_and_close(sink, epoch).await;
                        return SessionEnd::Closed;
                    };
                    if !frame.message.is_reliable() && frame.epoch != epoch {
                        tracing::debug!(kind = frame.message.kind(), "Dropping frame from a previous connection");
                        continue;
                    }
                    if let Err(e) = write(&mut sink, &frame.message).await {
                        let error = match &frame.message {
                            AgentMessage::Heartbeat { .. } => ConnectionError::HeartbeatSend(e.to_string()),
                            _ => e,
                        };
                        if frame.message.is_reliable() {
                            self.retry.push_back(frame.message);
                        }
                        return SessionEnd::Lost(error);
                    }
                }

                incoming = stream.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(_))) => {
                            tracing::warn!("Rejected binary frame from control server");
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Lost(ConnectionError::Closed);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Lost(ConnectionError::Transport(e)),
                    };

                    match ServerMessage::parse(text.as_str()) {
                        Ok(ServerMessage::Ping) => {
                            if let Err(e) = write(&mut sink, &AgentMessage::Pong).await {
                                return SessionEnd::Lost(e);
                            }
                        }
                        Ok(ServerMessage::Ack) => tracing::trace!("Heartbeat acknowledged"),
                        Ok(ServerMessage::Registered { .. }) => {
                            tracing::debug!("Ignoring repeated registration ack");
                        }
                        Ok(message) => {
                            if self.inbound_tx.send(message).await.is_err() {
                                self.flush_and_close(sink, epoch).await;
                                return SessionEnd::Closed;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Rejected inbound frame"),
                    }
                }
            }
        }
    }

    /// Write what is already queued, bounded by the flush timeout, then
    /// close the socket.
    async fn flush_and_close(&mut self, mut sink: WsSink, epoch: u64) {
        let deadline = Instant::now() + self.flush_timeout;
        let mut flushed = 0usize;

        while let Ok(frame) = self.outbound_rx.try_recv() {
            if !frame.message.is_reliable() && frame.epoch != epoch {
                continue;
            }
            match tokio::time::timeout_at(deadline, write(&mut sink, &frame.message)).await {
                Ok(Ok(())) => flushed += 1,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Flush interrupted by transport error");
                    if frame.message.is_reliable() {
                        self.retry.push_back(frame.message);
                    }
                    break;
                }
                Err(_) => {
                    tracing::warn!("Flush timed out");
                    if frame.message.is_reliable() {
                        self.retry.push_back(frame.message);
                    }
                    break;
                }
            }
        }

        if flushed > 0 {
            tracing::info!(frames = flushed, "Flushed queued frames before closing");
        }
        let _ = tokio::time::timeout_at(deadline, sink.send(Message::Close(None))).await;
        let _ = tokio::time::timeout_at(deadline, sink.close()).await;
    }

    fn report_unflushed(&mut self) {
        let mut lost: Vec<String> = Vec::new();
        while let Some(message) = self.retry.pop_front() {
            lost.push(message.kind().to_string());
        }
        while let Ok(frame) = self.outbound_rx.try_recv() {
            if frame.message.is_reliable() {
                lost.push(frame.message.kind().to_string());
            }
        }
        if !lost.is_empty() {
            tracing::warn!(frames = lost.len(), kinds = ?lost, "Closing with undelivered frames");
        }
    }
}

async fn write(sink: &mut WsSink, message: &AgentMessage) -> Result<(), ConnectionError> {
    let text = match message.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(kind = message.kind(), error = %e, "Failed to encode outbound frame, dropping it");
            return Ok(());
        }
    };
    sink.send(Message::text(text)).await?;
    Ok(())
}
