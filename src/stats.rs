use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::scheduler::JobStatus;

/// Job outcome counters, shared by the coordinator, heartbeats and the
/// status endpoint.
#[derive(Debug, Default)]
pub struct AgentStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_timed_out: AtomicU64,
    jobs_rejected: AtomicU64,
    active_jobs: AtomicU64,
    queued_jobs: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_rejected: u64,
    pub active_jobs: u64,
    pub queued_jobs: u64,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.jobs_completed,
            JobStatus::Failed => &self.jobs_failed,
            JobStatus::TimedOut => &self.jobs_timed_out,
            JobStatus::Pending | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_load(&self, active: usize, queued: usize) {
        self.active_jobs.store(active as u64, Ordering::Relaxed);
        self.queued_jobs.store(queued as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_terminal_outcomes_only() {
        let stats = AgentStats::new();
        stats.record_outcome(JobStatus::Completed);
        stats.record_outcome(JobStatus::Completed);
        stats.record_outcome(JobStatus::Failed);
        stats.record_outcome(JobStatus::TimedOut);
        stats.record_outcome(JobStatus::Running);
        stats.record_rejection();
        stats.set_load(2, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.jobs_completed, 2);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.jobs_timed_out, 1);
        assert_eq!(snap.jobs_rejected, 1);
        assert_eq!(snap.active_jobs, 2);
        assert_eq!(snap.queued_jobs, 3);
    }
}
