//! Runs one container to completion under a wall-clock limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};

/// Appended to logs that lost their oldest content.
pub const TRUNCATION_MARKER: &str = "\n[hypernode: earlier output truncated]";

/// Keeps the newest `max` bytes of combined stdout/stderr.
#[derive(Debug)]
pub struct LogBuffer {
    max: usize,
    bytes: VecDeque<u8>,
    truncated: bool,
}

impl LogBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            bytes: VecDeque::with_capacity(max.min(64 * 1024)),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.max {
            self.truncated |= !self.bytes.is_empty() || chunk.len() > self.max;
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.max..]);
            return;
        }
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.max);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.truncated = true;
        }
        self.bytes.extend(chunk);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Render the reported log. Never longer than `max` bytes; when content
    /// was dropped the marker is included in that bound.
    pub fn finalize(self) -> String {
        let bytes: Vec<u8> = self.bytes.into_iter().collect();
        let mut tail = bytes.as_slice();
        if self.truncated {
            // Do not start in the middle of a multi-byte character.
            while let Some((&first, rest)) = tail.split_first() {
                if first & 0b1100_0000 != 0b1000_0000 {
                    break;
                }
                tail = rest;
            }
        }

        // Invalid bytes widen to U+FFFD, so output that fit as bytes may not
        // fit as text.
        let text = String::from_utf8_lossy(tail).into_owned();
        if !self.truncated && text.len() <= self.max {
            return text;
        }

        if self.max <= TRUNCATION_MARKER.len() {
            return fit_tail(TRUNCATION_MARKER.to_string(), self.max);
        }
        let mut text = fit_tail(text, self.max - TRUNCATION_MARKER.len());
        text.push_str(TRUNCATION_MARKER);
        text
    }
}

/// Drop leading characters until `text` fits in `max` bytes.
fn fit_tail(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub logs: String,
}

/// Spawns a container, captures its output and enforces the timeout.
pub struct ContainerRunner {
    runtime: Arc<dyn ContainerRuntime>,
    max_log_size: usize,
    kill_grace: Duration,
}

impl ContainerRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, max_log_size: usize, kill_grace: Duration) -> Self {
        Self {
            runtime,
            max_log_size,
            kill_grace,
        }
    }

    /// Run `spec` until it exits, times out or `cancel` fires. The container
    /// is removed on every path once it was created.
    pub async fn run(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RuntimeError> {
        let mut container = match self.runtime.spawn(spec).await {
            Ok(container) => container,
            Err(e) => {
                // A partially created container may still exist.
                let _ = self.runtime.remove(&spec.name).await;
                return Err(e);
            }
        };
        let logs = Arc::new(Mutex::new(LogBuffer::new(self.max_log_size)));

        let stdout = container.child.stdout.take();
        let stderr = container.child.stderr.take();
        let readers = (
            stdout.map(|s| tokio::spawn(drain(s, logs.clone()))),
            stderr.map(|s| tokio::spawn(drain(s, logs.clone()))),
        );

        let outcome = tokio::select! {
            status = container.child.wait() => match status {
                Ok(status) => RunOutcome::Exited(status.code()),
                Err(e) => {
                    tracing::warn!(container = %container.name, error = %e, "Lost track of container process");
                    RunOutcome::Exited(None)
                }
            },
            _ = tokio::time::sleep(timeout) => RunOutcome::TimedOut,
            _ = cancel.cancelled() => RunOutcome::Cancelled,
        };

        if !matches!(outcome, RunOutcome::Exited(_)) {
            if let Err(e) = self.runtime.kill(&container.name).await {
                tracing::debug!(container = %container.name, error = %e, "Runtime kill failed");
            }
            let _ = container.child.start_kill();
            if tokio::time::timeout(self.kill_grace, container.child.wait()).await.is_err() {
                tracing::warn!(container = %container.name, "Container did not exit within kill grace");
            }
        }

        // Output pipes close once the process is gone; bound the wait anyway
        // in case a grandchild still holds them.
        for reader in [readers.0, readers.1].into_iter().flatten() {
            if tokio::time::timeout(self.kill_grace, reader).await.is_err() {
                tracing::debug!(container = %container.name, "Output reader did not finish");
            }
        }

        if let Err(e) = self.runtime.remove(&container.name).await {
            tracing::warn!(container = %container.name, error = %e, "Failed to remove container");
        }

        let mut buffer = std::mem::replace(&mut *logs.lock().await, LogBuffer::new(0));

        match outcome {
            RunOutcome::TimedOut => buffer.push(
                format!("\n[hypernode: job exceeded timeout of {}s and was terminated]", timeout.as_secs())
                    .as_bytes(),
            ),
            RunOutcome::Cancelled => buffer.push(b"\n[hypernode: job cancelled]"),
            RunOutcome::Exited(_) => {}
        }

        Ok(RunReport {
            outcome,
            logs: buffer.finalize(),
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, logs: Arc<Mutex<LogBuffer>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => logs.lock().await.push(&chunk[..n]),
        }
    }
}
