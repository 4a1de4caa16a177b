use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::SendError;
use crate::identity::NodeIdentity;
use crate::protocol::AgentMessage;
use crate::stats::AgentStats;

/// Periodically reports liveness and load while the agent is registered.
///
/// Ticks only in the `Registered` state and restarts its interval on every
/// re-registration. A heartbeat that cannot be queued is skipped, never
/// retried; the next tick carries fresher stats anyway.
pub struct HeartbeatSender {
    interval: Duration,
    handle: ConnectionHandle,
    identity: Arc<NodeIdentity>,
    stats: Arc<AgentStats>,
}

impl HeartbeatSender {
    pub fn new(
        interval: Duration,
        handle: ConnectionHandle,
        identity: Arc<NodeIdentity>,
        stats: Arc<AgentStats>,
    ) -> Self {
        Self {
            interval,
            handle,
            identity,
            stats,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut state = self.handle.subscribe();

        loop {
            // Wait for registration
            loop {
                if *state.borrow_and_update() == ConnectionState::Registered {
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *state.borrow() != ConnectionState::Registered {
                            tracing::debug!("Heartbeats paused until re-registration");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if !self.beat() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Queue one heartbeat. Returns false once the connection is gone for good.
    fn beat(&self) -> bool {
        let Some(node_id) = self.identity.node_id() else {
            return true;
        };
        let message = AgentMessage::Heartbeat {
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            stats: self.stats.snapshot(),
        };
        match self.handle.try_send(message) {
            Ok(()) => {
                tracing::trace!("Heartbeat queued");
                true
            }
            Err(SendError::Full) => {
                tracing::warn!("Outbound queue full, skipping heartbeat");
                true
            }
            Err(SendError::Closed) => false,
        }
    }
}
