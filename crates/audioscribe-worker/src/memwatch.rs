//! Best-effort peak device memory sampling.
//!
//! The worker's visible device is always index zero. Samples go through
//! NVML driver queries; when NVML is unavailable (CPU-only hosts, CI) the
//! watch degrades to reporting nothing rather than failing the task.

use parking_lot::Mutex;
use tracing::debug;

use audioscribe_gpu::{GpuProbe, NvmlProbe};

pub struct MemoryWatch {
    probe: Option<NvmlProbe>,
    baseline_gb: f64,
    peak_gb: Mutex<f64>,
}

impl MemoryWatch {
    pub fn new() -> Self {
        let probe = NvmlProbe::new().ok();
        let baseline_gb = probe
            .as_ref()
            .and_then(|p| Self::used_gb(p))
            .unwrap_or(0.0);
        debug!(baseline_gb, nvml = probe.is_some(), "memory watch started");
        Self {
            probe,
            baseline_gb,
            peak_gb: Mutex::new(baseline_gb),
        }
    }

    fn used_gb(probe: &NvmlProbe) -> Option<f64> {
        probe
            .snapshot()
            .ok()
            .and_then(|snapshots| snapshots.first().map(|s| s.used_memory))
    }

    /// Take a sample, keeping the maximum seen.
    pub fn sample(&self) {
        let Some(probe) = &self.probe else { return };
        if let Some(used) = Self::used_gb(probe) {
            let mut peak = self.peak_gb.lock();
            if used > *peak {
                *peak = used;
            }
        }
    }

    /// Peak usage attributable to this task: max observed minus the
    /// baseline at start. `None` when the driver was never readable.
    pub fn peak_delta_gb(&self) -> Option<f64> {
        self.probe.as_ref()?;
        let peak = *self.peak_gb.lock();
        Some((peak - self.baseline_gb).max(0.0))
    }
}

impl Default for MemoryWatch {
    fn default() -> Self {
        Self::new()
    }
}
