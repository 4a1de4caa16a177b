use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::config::CapacityConfig;
use crate::scheduler::job::{JobAssignment, ResourceClass};

/// Capacity held by one admitted job until it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: String,
    pub class: ResourceClass,
    /// CPU reserved in millicores (zero for GPU jobs)
    pub cpu_millis: u32,
    /// GPU device handed to the job
    pub gpu_device: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    Duplicate,
    ExceedsCapacity(String),
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::QueueFull => write!(f, "local job queue is full"),
            RejectReason::Duplicate => write!(f, "job is already queued or running"),
            RejectReason::ExceedsCapacity(detail) => write!(f, "job can never fit: {}", detail),
            RejectReason::ShuttingDown => write!(f, "agent is shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Capacity reserved, the job may start immediately
    Admitted(Reservation),
    /// Waiting behind earlier jobs of the same class (1-based position)
    Queued { position: usize },
    Rejected(RejectReason),
}

/// A queued job removed by [`AdmissionController::cancel_queued`].
#[derive(Debug)]
pub struct CancelledJob {
    pub job: JobAssignment,
    /// Jobs admitted because the cancelled one no longer blocks them
    pub started: Vec<(JobAssignment, Reservation)>,
}

/// Totals and current reservations. `reserved <= total` at all times.
#[derive(Debug, Clone)]
struct Capacity {
    max_running: usize,
    running: usize,
    cpu_total_millis: u32,
    cpu_reserved_millis: u32,
    gpu_devices: Vec<u32>,
    free_gpus: BTreeSet<u32>,
}

impl Capacity {
    fn fits(&self, class: ResourceClass, cpu_millis: u32) -> bool {
        if self.running >= self.max_running {
            return false;
        }
        match class {
            ResourceClass::Cpu => self.cpu_reserved_millis + cpu_millis <= self.cpu_total_millis,
            ResourceClass::Gpu => !self.free_gpus.is_empty(),
        }
    }

    fn reserve(&mut self, job_id: &str, class: ResourceClass, cpu_millis: u32) -> Option<Reservation> {
        if !self.fits(class, cpu_millis) {
            return None;
        }
        let reservation = match class {
            ResourceClass::Cpu => {
                self.cpu_reserved_millis += cpu_millis;
                Reservation {
                    job_id: job_id.to_string(),
                    class,
                    cpu_millis,
                    gpu_device: None,
                }
            }
            ResourceClass::Gpu => {
                let device = self.free_gpus.pop_first()?;
                Reservation {
                    job_id: job_id.to_string(),
                    class,
                    cpu_millis: 0,
                    gpu_device: Some(device),
                }
            }
        };
        self.running += 1;
        Some(reservation)
    }

    fn release(&mut self, reservation: &Reservation) {
        self.running = self.running.saturating_sub(1);
        self.cpu_reserved_millis = self.cpu_reserved_millis.saturating_sub(reservation.cpu_millis);
        if let Some(device) = reservation.gpu_device {
            self.free_gpus.insert(device);
        }
    }
}

#[derive(Debug)]
struct QueuedJob {
    seq: u64,
    cpu_millis: u32,
    assignment: JobAssignment,
}

/// Point-in-time view of capacity, for heartbeats and the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    pub max_concurrent_jobs: usize,
    pub running_jobs: usize,
    pub queued_jobs: usize,
    pub cpu_total: f64,
    pub cpu_reserved: f64,
    pub gpu_total: usize,
    pub gpu_reserved: usize,
}

/// Decides which assignments run now, wait, or get turned away.
///
/// Jobs of one resource class are admitted strictly in arrival order: a job
/// that would fit never overtakes an earlier queued job of its class.
#[derive(Debug)]
pub struct AdmissionController {
    capacity: Capacity,
    queues: HashMap<ResourceClass, VecDeque<QueuedJob>>,
    running: HashSet<String>,
    max_queued: usize,
    default_cpu_millis: u32,
    next_seq: u64,
    closed: bool,
}

fn cores_to_millis(cores: f64) -> u32 {
    ((cores * 1000.0).round() as u32).max(1)
}

impl AdmissionController {
    pub fn new(config: &CapacityConfig, default_cpu_limit: f64) -> Self {
        Self {
            capacity: Capacity {
                max_running: config.max_concurrent_jobs,
                running: 0,
                cpu_total_millis: cores_to_millis(config.cpu_budget),
                cpu_reserved_millis: 0,
                gpu_devices: config.gpu_devices.clone(),
                free_gpus: config.gpu_devices.iter().copied().collect(),
            },
            queues: HashMap::new(),
            running: HashSet::new(),
            max_queued: config.max_queued_jobs,
            default_cpu_millis: cores_to_millis(default_cpu_limit),
            next_seq: 0,
            closed: false,
        }
    }

    fn cpu_demand(&self, job: &JobAssignment) -> u32 {
        match job.resource_type {
            ResourceClass::Gpu => 0,
            ResourceClass::Cpu => job
                .cpu_limit
                .filter(|c| *c > 0.0)
                .map(cores_to_millis)
                .unwrap_or(self.default_cpu_millis),
        }
    }

    fn is_known(&self, job_id: &str) -> bool {
        self.running.contains(job_id)
            || self
                .queues
                .values()
                .any(|q| q.iter().any(|j| j.assignment.job_id == job_id))
    }

    pub fn queued_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Reserve capacity for `job`, queue it, or reject it.
    pub fn try_admit(&mut self, job: &JobAssignment) -> Admission {
        if self.closed {
            return Admission::Rejected(RejectReason::ShuttingDown);
        }
        if self.is_known(&job.job_id) {
            return Admission::Rejected(RejectReason::Duplicate);
        }

        let class = job.resource_type;
        let cpu_millis = self.cpu_demand(job);
        match class {
            ResourceClass::Gpu if self.capacity.gpu_devices.is_empty() => {
                return Admission::Rejected(RejectReason::ExceedsCapacity(
                    "no GPUs on this node".to_string(),
                ));
            }
            ResourceClass::Cpu if cpu_millis > self.capacity.cpu_total_millis => {
                return Admission::Rejected(RejectReason::ExceedsCapacity(format!(
                    "requests {} CPU millicores, budget is {}",
                    cpu_millis, self.capacity.cpu_total_millis
                )));
            }
            _ => {}
        }

        let class_queue_empty = self.queues.get(&class).map_or(true, VecDeque::is_empty);
        if class_queue_empty {
            if let Some(reservation) = self.capacity.reserve(&job.job_id, class, cpu_millis) {
                self.running.insert(job.job_id.clone());
                return Admission::Admitted(reservation);
            }
        }

        if self.queued_len() >= self.max_queued {
            return Admission::Rejected(RejectReason::QueueFull);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let queue = self.queues.entry(class).or_default();
        queue.push_back(QueuedJob {
            seq,
            cpu_millis,
            assignment: job.clone(),
        });
        Admission::Queued {
            position: queue.len(),
        }
    }

    /// Return a finished job's capacity, then admit whatever queued jobs now
    /// fit, oldest first.
    pub fn release(&mut self, reservation: &Reservation) -> Vec<(JobAssignment, Reservation)> {
        if !self.running.remove(&reservation.job_id) {
            tracing::warn!(job_id = %reservation.job_id, "Release for a job that holds no reservation");
            return Vec::new();
        }
        self.capacity.release(reservation);
        if self.closed {
            return Vec::new();
        }
        self.admit_queued()
    }

    fn admit_queued(&mut self) -> Vec<(JobAssignment, Reservation)> {
        let mut admitted = Vec::new();
        loop {
            let next = self
                .queues
                .iter()
                .filter_map(|(class, queue)| queue.front().map(|head| (*class, head)))
                .filter(|(class, head)| self.capacity.fits(*class, head.cpu_millis))
                .min_by_key(|(_, head)| head.seq)
                .map(|(class, _)| class);

            let Some(class) = next else {
                break;
            };
            let Some(head) = self.queues.get_mut(&class).and_then(VecDeque::pop_front) else {
                break;
            };
            match self
                .capacity
                .reserve(&head.assignment.job_id, class, head.cpu_millis)
            {
                Some(reservation) => {
                    self.running.insert(head.assignment.job_id.clone());
                    admitted.push((head.assignment, reservation));
                }
                None => {
                    self.queues.entry(class).or_default().push_front(head);
                    break;
                }
            }
        }
        admitted
    }

    /// Remove a job that has not started yet.
    ///
    /// The removed job may have been holding up its class queue, so the
    /// queues are re-checked and anything that now fits is admitted.
    pub fn cancel_queued(&mut self, job_id: &str) -> Option<CancelledJob> {
        let cancelled = self.queues.values_mut().find_map(|queue| {
            let pos = queue.iter().position(|j| j.assignment.job_id == job_id)?;
            queue.remove(pos)
        })?;
        let started = if self.closed {
            Vec::new()
        } else {
            self.admit_queued()
        };
        Some(CancelledJob {
            job: cancelled.assignment,
            started,
        })
    }

    /// Stop admitting and hand back everything still waiting, in arrival order.
    pub fn close(&mut self) -> Vec<JobAssignment> {
        self.closed = true;
        let mut drained: Vec<QueuedJob> = self.queues.values_mut().flat_map(|q| q.drain(..)).collect();
        drained.sort_by_key(|j| j.seq);
        drained.into_iter().map(|j| j.assignment).collect()
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            max_concurrent_jobs: self.capacity.max_running,
            running_jobs: self.capacity.running,
            queued_jobs: self.queued_len(),
            cpu_total: self.capacity.cpu_total_millis as f64 / 1000.0,
            cpu_reserved: self.capacity.cpu_reserved_millis as f64 / 1000.0,
            gpu_total: self.capacity.gpu_devices.len(),
            gpu_reserved: self.capacity.gpu_devices.len() - self.capacity.free_gpus.len(),
        }
    }
}
