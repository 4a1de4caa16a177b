//! Job execution on this node.
//!
//! - [`JobExecutor`]: prepares the workspace and turns one assignment into a
//!   terminal [`JobExecutionRecord`](crate::scheduler::JobExecutionRecord)
//! - [`runner`]: drives a single container under its timeout and captures
//!   bounded output
//! - [`runtime`]: the container engine seam and its Docker CLI implementation
//! - [`proof`]: deterministic execution and log hashes
//! - [`reporter`]: ordered delivery of results and rejections
//! - [`heartbeat`]: liveness reports while registered
//!
//! # Execution Flow
//!
//! 1. The coordinator admits a job and hands it to [`JobExecutor::execute`]
//! 2. The script is written to a fresh workspace and a sandboxed container
//!    is started with the job's resource limits
//! 3. Output is captured until exit, timeout or cancellation
//! 4. The container and workspace are removed and the record is finalized
//!    with its proof hashes
//! 5. The record goes to the [`reporter::ResultReporter`]

pub mod executor;
pub mod heartbeat;
pub mod proof;
pub mod reporter;
pub mod runner;
pub mod runtime;

pub use executor::JobExecutor;
pub use heartbeat::HeartbeatSender;
pub use reporter::{ReportItem, ResultReporter};
pub use runtime::{ContainerRuntime, DockerCli, RuntimeError};
