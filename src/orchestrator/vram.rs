// Keystone Orchestrator — VRAM Probe
// Device-memory readings via `nvidia-smi`. Handoff preconditions poll this
// until usage drops under the release threshold; status endpoints surface
// the same numbers. Injectable so tests and GPU-less dev machines don't
// need the binary.

use crate::atoms::constants::VRAM_RELEASED_MIB;
use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub free_gb: f64,
    pub total_gb: f64,
    pub used_gb: f64,
    pub utilization_pct: f64,
}

#[async_trait]
pub trait VramProbe: Send + Sync {
    /// Current device memory used, in MiB.
    async fn used_mib(&self) -> EngineResult<u64>;

    async fn info(&self) -> EngineResult<GpuInfo>;
}

/// Probe backed by the `nvidia-smi` CLI.
pub struct NvidiaSmiProbe;

#[async_trait]
impl VramProbe for NvidiaSmiProbe {
    async fn used_mib(&self) -> EngineResult<u64> {
        let out = tokio::process::Command::new("nvidia-smi")
            .args(["--query-gpu=memory.used", "--format=csv,noheader,nounits"])
            .output()
            .await?;
        if !out.status.success() {
            return Err(EngineError::Other("nvidia-smi returned non-zero".into()));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        text.lines()
            .next()
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| EngineError::Other("unparseable nvidia-smi output".into()))
    }

    async fn info(&self) -> EngineResult<GpuInfo> {
        let out = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.free,memory.total,memory.used,utilization.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await?;
        if !out.status.success() {
            return Err(EngineError::Other("nvidia-smi returned non-zero".into()));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let line = text.lines().next().unwrap_or_default();
        let parts: Vec<f64> =
            line.split(',').filter_map(|p| p.trim().parse::<f64>().ok()).collect();
        if parts.len() != 4 {
            return Err(EngineError::Other("unparseable nvidia-smi output".into()));
        }
        Ok(GpuInfo {
            free_gb: parts[0] / 1024.0,
            total_gb: parts[1] / 1024.0,
            used_gb: parts[2] / 1024.0,
            utilization_pct: parts[3],
        })
    }
}

/// Poll until used VRAM drops below the release threshold or the deadline
/// passes. A probe error counts as "not yet released".
pub async fn wait_until_released(
    probe: &dyn VramProbe,
    timeout: Duration,
    interval: Duration,
) -> EngineResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match probe.used_mib().await {
            Ok(used) if used < VRAM_RELEASED_MIB => return Ok(()),
            Ok(used) => debug!("[vram] still {} MiB in use", used),
            Err(e) => debug!("[vram] probe error while waiting: {e}"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::Timeout("VRAM did not drop below threshold".into()));
        }
        tokio::time::sleep(interval).await;
    }
}
