use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;
use crate::identity::NodeIdentity;
use crate::protocol::{AgentMessage, JobOutput};
use crate::scheduler::JobExecutionRecord;

/// Something the server must hear about exactly once.
#[derive(Debug)]
pub enum ReportItem {
    Result(JobExecutionRecord),
    Rejected { job_id: String, reason: String },
}

/// Turns terminal job records into outbound frames, in completion order.
///
/// Sends wait for queue space instead of dropping, so a slow or disconnected
/// server applies backpressure here rather than losing results.
pub struct ResultReporter {
    handle: ConnectionHandle,
    identity: Arc<NodeIdentity>,
    rx: mpsc::UnboundedReceiver<ReportItem>,
}

impl ResultReporter {
    pub fn new(
        handle: ConnectionHandle,
        identity: Arc<NodeIdentity>,
    ) -> (Self, mpsc::UnboundedSender<ReportItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                handle,
                identity,
                rx,
            },
            tx,
        )
    }

    /// Runs until every sender is dropped and the queue is drained.
    pub async fn run(mut self) {
        while let Some(item) = self.rx.recv().await {
            let Some(message) = self.build(item) else {
                continue;
            };
            let kind = message.kind();
            if let Err(e) = self.handle.send(message).await {
                tracing::error!(error = %e, kind, "Cannot report job outcome, connection closed");
                return;
            }
        }
        tracing::debug!("Result reporter stopped");
    }

    fn build(&self, item: ReportItem) -> Option<AgentMessage> {
        let node_id = self.identity.node_id().unwrap_or_default().to_string();
        match item {
            ReportItem::Result(record) => {
                if !record.status().is_terminal() {
                    tracing::error!(job_id = %record.job_id(), status = %record.status(), "Refusing to report a non-terminal job");
                    return None;
                }
                tracing::info!(job_id = %record.job_id(), status = %record.status(), "Reporting job result");
                Some(AgentMessage::JobResult {
                    job_id: record.job_id().to_string(),
                    node_id,
                    status: record.status(),
                    result: JobOutput {
                        logs: record.logs().to_string(),
                        exit_code: record.exit_code(),
                        execution_hash: record.execution_hash().to_string(),
                        logs_hash: record.logs_hash().to_string(),
                    },
                })
            }
            ReportItem::Rejected { job_id, reason } => {
                tracing::info!(job_id = %job_id, reason = %reason, "Reporting job rejection");
                Some(AgentMessage::JobRejected {
                    job_id,
                    node_id,
                    reason,
                })
            }
        }
    }
}
