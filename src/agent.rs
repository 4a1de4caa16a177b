use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::error::AgentError;
use crate::identity::NodeIdentity;
use crate::protocol::ServerMessage;
use crate::scheduler::{
    Admission, AdmissionController, JobAssignment, JobExecutionRecord, JobStatus, RejectReason,
    Reservation,
};
use crate::stats::AgentStats;
use crate::status::{run_status_server, StatusState};
use crate::worker::{ContainerRuntime, HeartbeatSender, JobExecutor, ReportItem, ResultReporter};

/// Top-level agent that wires all components together.
pub struct Agent {
    config: AgentConfig,
    identity: Arc<NodeIdentity>,
    runtime: Arc<dyn ContainerRuntime>,
    stats: Arc<AgentStats>,
    admission: Arc<RwLock<AdmissionController>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        identity: Arc<NodeIdentity>,
    ) -> Self {
        let admission = AdmissionController::new(&config.capacity, config.sandbox.cpu_limit);
        Self {
            config,
            identity,
            runtime,
            stats: Arc::new(AgentStats::new()),
            admission: Arc::new(RwLock::new(admission)),
        }
    }

    pub fn stats(&self) -> Arc<AgentStats> {
        self.stats.clone()
    }

    /// Run the agent until `shutdown` fires or the server rejects the token.
    ///
    /// Starts the subsystems:
    /// 1. Connection manager (connect, register, reconnect)
    /// 2. Heartbeat sender
    /// 3. Result reporter
    /// 4. Optionally the local status server
    ///
    /// then dispatches assignments until shutdown. On shutdown queued jobs are
    /// rejected, running jobs get `shutdown_grace` to finish before they are
    /// killed, and buffered results are flushed before the socket closes.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::RegistrationRejected` if the server refuses the
    /// token, or a configuration error for an unusable endpoint.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let url = self.config.connection.endpoint_url()?;
        tracing::info!(
            endpoint = %url,
            token = %self.config.redacted_token(),
            hostname = %self.identity.host_info().hostname,
            max_concurrent_jobs = self.config.capacity.max_concurrent_jobs,
            gpus = self.identity.gpus().len(),
            "Agent starting"
        );

        let (manager, handle, mut inbound) = ConnectionManager::new(
            url,
            self.config.connection.clone(),
            self.identity.clone(),
            self.config.shutdown_flush_timeout,
        );
        let mut connection_task = tokio::spawn(manager.run());

        // Background tasks stop with this token; the connection stops last.
        let background = CancellationToken::new();

        let heartbeat = HeartbeatSender::new(
            self.config.heartbeat_interval,
            handle.clone(),
            self.identity.clone(),
            self.stats.clone(),
        );
        let heartbeat_token = background.clone();
        let heartbeat_task = tokio::spawn(async move {
            heartbeat.run(heartbeat_token).await;
        });

        let (reporter, reports) = ResultReporter::new(handle.clone(), self.identity.clone());
        let reporter_task = tokio::spawn(reporter.run());

        let status_task = self.config.status_port.map(|port| {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let state = StatusState {
                identity: self.identity.clone(),
                stats: self.stats.clone(),
                admission: self.admission.clone(),
                connection: handle.subscribe(),
            };
            tokio::spawn(run_status_server(addr, state, background.clone()))
        });

        let mut jobs = Jobs {
            executor: Arc::new(JobExecutor::new(self.config.sandbox.clone(), self.runtime.clone())),
            admission: self.admission.clone(),
            stats: self.stats.clone(),
            reports,
            workers: JoinSet::new(),
            running: HashMap::new(),
            cancel_all: CancellationToken::new(),
        };

        let mut connection_finished = false;
        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }

                Some(message) = inbound.next() => {
                    jobs.on_message(message).await;
                }

                Some(joined) = jobs.workers.join_next() => {
                    jobs.on_joined(joined).await;
                }

                result = &mut connection_task => {
                    connection_finished = true;
                    break match result {
                        Ok(result) => result,
                        Err(e) => Err(AgentError::Internal(format!("connection task failed: {}", e))),
                    };
                }
            }
        };

        // A fatal connection error leaves nobody to report to.
        let grace = if outcome.is_ok() {
            self.config.shutdown_grace
        } else {
            Duration::ZERO
        };
        jobs.drain(grace).await;

        let Jobs { reports, .. } = jobs;
        drop(reports);
        if tokio::time::timeout(self.config.shutdown_flush_timeout, reporter_task)
            .await
            .is_err()
        {
            tracing::warn!("Result reporter did not finish before the flush timeout");
        }

        background.cancel();
        handle.close();
        let _ = heartbeat_task.await;
        if let Some(status_task) = status_task {
            if let Err(e) = status_task.await {
                tracing::error!(error = %e, "Status server task failed");
            }
        }

        if !connection_finished {
            match connection_task.await {
                Ok(Err(e)) => tracing::warn!(error = %e, "Connection manager stopped with error"),
                Err(e) => tracing::error!(error = %e, "Connection task failed"),
                Ok(Ok(())) => {}
            }
        }

        match &outcome {
            Ok(()) => tracing::info!("Agent stopped"),
            Err(e) => tracing::error!(error = %e, "Agent stopped"),
        }
        outcome
    }
}

/// Outcome of one worker task.
struct Finished {
    reservation: Reservation,
    record: JobExecutionRecord,
}

/// Coordinator-owned job bookkeeping.
struct Jobs {
    executor: Arc<JobExecutor>,
    admission: Arc<RwLock<AdmissionController>>,
    stats: Arc<AgentStats>,
    reports: mpsc::UnboundedSender<ReportItem>,
    workers: JoinSet<Finished>,
    running: HashMap<String, CancellationToken>,
    /// Parent of every per-job token
    cancel_all: CancellationToken,
}

impl Jobs {
    async fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Job(job) => self.on_assignment(job).await,
            ServerMessage::JobCancel { job_id } => self.on_cancel(&job_id).await,
            ServerMessage::Error { message } => {
                tracing::warn!(message = %message, "Control server reported an error");
            }
            other => tracing::debug!(kind = other.kind(), "Ignoring message"),
        }
    }

    async fn on_assignment(&mut self, job: JobAssignment) {
        tracing::info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            class = %job.resource_type,
            "Job assigned"
        );

        let admission = self.admission.write().await.try_admit(&job);
        match admission {
            Admission::Admitted(reservation) => self.start(job, reservation),
            Admission::Queued { position } => {
                tracing::info!(job_id = %job.job_id, position, "Job queued, waiting for capacity");
            }
            Admission::Rejected(reason) => self.reject(job.job_id, reason),
        }
        self.update_load().await;
    }

    async fn on_cancel(&mut self, job_id: &str) {
        let cancelled = self.admission.write().await.cancel_queued(job_id);
        if let Some(cancelled) = cancelled {
            tracing::info!(job_id, "Queued job cancelled by server");
            for (job, reservation) in cancelled.started {
                tracing::info!(job_id = %job.job_id, "Starting queued job");
                self.start(job, reservation);
            }
            self.update_load().await;
        } else if let Some(token) = self.running.get(job_id) {
            tracing::info!(job_id, "Running job cancelled by server");
            token.cancel();
        } else {
            tracing::debug!(job_id, "Cancel for unknown job");
        }
    }

    fn reject(&self, job_id: String, reason: RejectReason) {
        tracing::warn!(job_id = %job_id, reason = %reason, "Job rejected");
        self.stats.record_rejection();
        let _ = self.reports.send(ReportItem::Rejected {
            job_id,
            reason: reason.to_string(),
        });
    }

    fn start(&mut self, job: JobAssignment, reservation: Reservation) {
        let token = self.cancel_all.child_token();
        self.running.insert(job.job_id.clone(), token.clone());

        let executor = self.executor.clone();
        let inner_reservation = reservation.clone();
        self.workers.spawn(async move {
            let job_id = job.job_id.clone();
            let execution = tokio::spawn(async move {
                executor.execute(&job, &inner_reservation, &token).await
            });
            let record = match execution.await {
                Ok(record) => record,
                Err(e) => crashed_record(&job_id, &e),
            };
            Finished {
                reservation,
                record,
            }
        });
    }

    async fn on_joined(&mut self, joined: Result<Finished, JoinError>) {
        let finished = match joined {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(error = %e, "Worker task failed");
                return;
            }
        };
        let Finished {
            reservation,
            record,
        } = finished;

        self.running.remove(record.job_id());
        self.stats.record_outcome(record.status());
        let _ = self.reports.send(ReportItem::Result(record));

        let next = self.admission.write().await.release(&reservation);
        for (job, reservation) in next {
            tracing::info!(job_id = %job.job_id, "Starting queued job");
            self.start(job, reservation);
        }
        self.update_load().await;
    }

    async fn update_load(&self) {
        let admission = self.admission.read().await;
        self.stats
            .set_load(admission.running_len(), admission.queued_len());
    }

    /// Stop admitting, reject everything queued, and wait up to `grace` for
    /// running jobs before killing them.
    async fn drain(&mut self, grace: Duration) {
        let queued = self.admission.write().await.close();
        for job in queued {
            self.reject(job.job_id, RejectReason::ShuttingDown);
        }
        self.update_load().await;

        if self.workers.is_empty() {
            return;
        }
        tracing::info!(
            running = self.workers.len(),
            grace_secs = grace.as_secs(),
            "Waiting for running jobs"
        );

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(joined)) => self.on_joined(joined).await,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        tracing::warn!(running = self.workers.len(), "Grace period over, terminating running jobs");
        self.cancel_all.cancel();
        while let Some(joined) = self.workers.join_next().await {
            self.on_joined(joined).await;
        }
    }
}

fn crashed_record(job_id: &str, error: &JoinError) -> JobExecutionRecord {
    tracing::error!(job_id, error = %error, "Job execution task failed");
    let mut record = JobExecutionRecord::new(job_id);
    let _ = record.start();
    let _ = record.finish(
        JobStatus::Failed,
        None,
        "[hypernode: job execution aborted by an internal error]".to_string(),
    );
    record
}
