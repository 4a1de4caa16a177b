//! Execution proof hashes attached to every job result.
//!
//! `executionHash` is the hex SHA-256 of the compact JSON object
//! `{"exitCode":..,"jobId":..,"status":..}` with keys in that order.
//! `logsHash` is the hex SHA-256 of the reported (already truncated) logs.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::scheduler::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub execution_hash: String,
    pub logs_hash: String,
}

// Field order is part of the hash input.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionSummary<'a> {
    exit_code: Option<i32>,
    job_id: &'a str,
    status: &'a str,
}

pub fn generate(job_id: &str, status: JobStatus, exit_code: Option<i32>, logs: &[u8]) -> Proof {
    let summary = ExecutionSummary {
        exit_code,
        job_id,
        status: status.as_str(),
    };
    // Serializing a struct of plain strings and integers cannot fail.
    let canonical = serde_json::to_vec(&summary).unwrap_or_default();

    Proof {
        execution_hash: sha256_hex(&canonical),
        logs_hash: sha256_hex(logs),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
