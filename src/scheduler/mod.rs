//! Local job bookkeeping: what the server assigned us and what may run now.

pub mod admission;
pub mod job;

pub use admission::{
    Admission, AdmissionController, CancelledJob, CapacitySnapshot, RejectReason, Reservation,
};
pub use job::{InvalidTransition, JobAssignment, JobExecutionRecord, JobStatus, ResourceClass};
