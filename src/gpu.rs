use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// One physical GPU as reported to the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub index: u32,
    pub model: String,
    pub vram: String,
}

/// Enumerate NVIDIA GPUs. A host without `nvidia-smi` simply has no GPUs.
pub async fn detect_gpus() -> Vec<GpuDescriptor> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(NVIDIA_SMI_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => {
            let gpus = parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout));
            for gpu in &gpus {
                tracing::info!(index = gpu.index, model = %gpu.model, vram = %gpu.vram, "GPU detected");
            }
            gpus
        }
        Ok(Ok(out)) => {
            tracing::warn!(status = ?out.status.code(), "nvidia-smi failed, assuming no GPUs");
            Vec::new()
        }
        Ok(Err(e)) => {
            tracing::info!(error = %e, "nvidia-smi not available, running CPU-only");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!("nvidia-smi timed out, assuming no GPUs");
            Vec::new()
        }
    }
}

/// Parse `index, name, memory.total` CSV rows.
pub fn parse_nvidia_smi(stdout: &str) -> Vec<GpuDescriptor> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 3 {
                return None;
            }
            let index = parts[0].parse().ok()?;
            Some(GpuDescriptor {
                index,
                model: parts[1].to_string(),
                vram: format!("{} MiB", parts[2]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_devices() {
        let out = "0, NVIDIA GeForce RTX 4090, 24564\n1, NVIDIA A100-SXM4-40GB, 40960\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].model, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].vram, "24564 MiB");
        assert_eq!(gpus[1].index, 1);
    }

    #[test]
    fn skips_blank_and_malformed_rows() {
        let out = "\nNo devices were found\nx, Broken, 1\n2, Tesla T4, 15360\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 2);
        assert_eq!(gpus[0].model, "Tesla T4");
    }
}
