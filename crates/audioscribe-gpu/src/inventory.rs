//! Device enumeration and telemetry via NVML.

use audioscribe_errors::{ScribeError, ScribeResult};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use serde::Serialize;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time view of one device as reported by the driver.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSnapshot {
    pub id: u32,
    pub name: String,
    /// Total device memory in GB.
    pub total_memory: f64,
    /// Memory currently in use on the device (all processes) in GB.
    pub used_memory: f64,
    /// Free device memory in GB.
    pub free_memory: f64,
    pub temperature: Option<u32>,
    pub utilization_gpu: Option<u32>,
    pub utilization_memory: Option<u32>,
}

/// Read-only source of device snapshots.
///
/// The scheduler talks to this trait so tests can substitute a fixed fleet
/// of fake devices.
pub trait GpuProbe: Send + Sync {
    /// Snapshot every readable device. A device that errors is omitted with
    /// a warning rather than failing the whole snapshot.
    fn snapshot(&self) -> ScribeResult<Vec<GpuSnapshot>>;
}

/// NVML-backed probe. Initializing NVML performs driver-level queries only;
/// it does not create a CUDA context.
pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    pub fn new() -> ScribeResult<Self> {
        let nvml = Nvml::init()
            .map_err(|err| ScribeError::Gpu(format!("NVML initialization failed: {err}")))?;
        Ok(Self { nvml })
    }

    fn snapshot_device(&self, index: u32) -> ScribeResult<GpuSnapshot> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|err| ScribeError::Gpu(format!("device {index}: {err}")))?;
        let name = device
            .name()
            .map_err(|err| ScribeError::Gpu(format!("device {index} name: {err}")))?;
        let memory = device
            .memory_info()
            .map_err(|err| ScribeError::Gpu(format!("device {index} memory: {err}")))?;

        // Temperature and utilization are optional telemetry; their absence
        // must not hide the device.
        let temperature = device.temperature(TemperatureSensor::Gpu).ok();
        let utilization = device.utilization_rates().ok();

        Ok(GpuSnapshot {
            id: index,
            name,
            total_memory: memory.total as f64 / BYTES_PER_GB,
            used_memory: memory.used as f64 / BYTES_PER_GB,
            free_memory: memory.free as f64 / BYTES_PER_GB,
            temperature,
            utilization_gpu: utilization.as_ref().map(|u| u.gpu),
            utilization_memory: utilization.map(|u| u.memory),
        })
    }
}

impl GpuProbe for NvmlProbe {
    fn snapshot(&self) -> ScribeResult<Vec<GpuSnapshot>> {
        let count = self
            .nvml
            .device_count()
            .map_err(|err| ScribeError::Gpu(format!("device count: {err}")))?;

        let mut snapshots = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.snapshot_device(index) {
                Ok(snapshot) => {
                    debug!(
                        gpu_id = index,
                        total = snapshot.total_memory,
                        used = snapshot.used_memory,
                        "gpu snapshot"
                    );
                    snapshots.push(snapshot);
                }
                Err(err) => warn!(gpu_id = index, %err, "skipping unreadable device"),
            }
        }
        Ok(snapshots)
    }
}

/// The device with the most free memory, if any. Used by status surfaces;
/// the dispatch loop iterates all eligible devices instead.
pub fn best_available(snapshots: &[GpuSnapshot]) -> Option<&GpuSnapshot> {
    snapshots
        .iter()
        .max_by(|a, b| a.free_memory.total_cmp(&b.free_memory))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: u32, free: f64) -> GpuSnapshot {
        GpuSnapshot {
            id,
            name: format!("Fake GPU {id}"),
            total_memory: 16.0,
            used_memory: 16.0 - free,
            free_memory: free,
            temperature: None,
            utilization_gpu: None,
            utilization_memory: None,
        }
    }

    #[test]
    fn best_available_prefers_most_free() {
        let fleet = vec![snap(0, 2.0), snap(1, 9.5), snap(2, 4.0)];
        assert_eq!(best_available(&fleet).unwrap().id, 1);
        assert!(best_available(&[]).is_none());
    }
}
