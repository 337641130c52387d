//! Accelerator memory probe
//!
//! Reads total device memory from `nvidia-smi` and feeds it to the
//! tracker, so the budget follows the hardware actually present.

use crate::error::{DaemonError, DaemonResult};
use control_plane::ResourceTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Total memory in MB of device `index` from
/// `nvidia-smi --query-gpu=memory.total --format=csv,noheader,nounits`.
pub fn parse_total_mb(output: &str, index: usize) -> DaemonResult<f64> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .nth(index)
        .ok_or_else(|| DaemonError::GpuParse(output.to_string()))?;
    // Some driver versions keep the unit despite `nounits`
    let value = line.trim_end_matches("MiB").trim();
    match value.parse::<f64>() {
        Ok(mb) if mb.is_finite() && mb > 0.0 => Ok(mb),
        _ => Err(DaemonError::GpuParse(line.to_string())),
    }
}

/// Run `nvidia-smi` once.
pub async fn probe_total_mb(index: usize) -> DaemonResult<f64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .await
        .map_err(|e| DaemonError::GpuProbe(e.to_string()))?;
    if !output.status.success() {
        return Err(DaemonError::GpuProbe(format!(
            "nvidia-smi exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_total_mb(&String::from_utf8_lossy(&output.stdout), index)
}

/// Poll the GPU until cancelled, pushing changes into the tracker.
pub async fn run_gpu_poller(
    tracker: Arc<ResourceTracker>,
    index: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut warned = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match probe_total_mb(index).await {
            Ok(total_mb) => {
                warned = false;
                if let Err(e) = tracker.set_total_vram(total_mb) {
                    tracing::warn!(error = %e, "GPU probe value rejected");
                }
            }
            Err(e) if !warned => {
                tracing::warn!(error = %e, "GPU probe failed; keeping configured VRAM");
                warned = true;
            }
            Err(e) => tracing::debug!(error = %e, "GPU probe still failing"),
        }
    }
    tracing::info!("GPU poller stopped");
}
