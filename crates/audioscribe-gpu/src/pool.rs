//! Scheduler-owned memory ledger, one pool per discovered device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::inventory::GpuSnapshot;

/// Serializable view of a pool for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub gpu_id: u32,
    pub total_memory: f64,
    pub reserved_memory: f64,
    pub allocated_memory: f64,
    pub free_memory: f64,
    pub available_memory: f64,
}

#[derive(Debug)]
struct PoolState {
    total_memory: f64,
    reserved_memory: f64,
    allocated_memory: f64,
    model_estimates: HashMap<String, f64>,
}

impl PoolState {
    fn free_memory(&self) -> f64 {
        (self.total_memory - self.allocated_memory - self.reserved_memory).max(0.0)
    }

    fn available_memory(&self, safety_margin: f64) -> f64 {
        (self.free_memory() - self.total_memory * safety_margin).max(0.0)
    }
}

/// Memory ledger for one GPU.
///
/// All mutations go through an exclusive lock with a bounded acquire: a
/// caller that cannot take the lock within the timeout treats the attempt
/// as an allocation failure instead of waiting forever.
#[derive(Debug)]
pub struct GpuMemoryPool {
    gpu_id: u32,
    safety_margin: f64,
    lock_timeout: Duration,
    state: Mutex<PoolState>,
}

impl GpuMemoryPool {
    pub fn new(gpu_id: u32, total_memory: f64, reserved_memory: f64, safety_margin: f64) -> Self {
        Self {
            gpu_id,
            safety_margin,
            lock_timeout: Duration::from_secs(5),
            state: Mutex::new(PoolState {
                total_memory,
                reserved_memory,
                allocated_memory: 0.0,
                model_estimates: HashMap::new(),
            }),
        }
    }

    pub fn gpu_id(&self) -> u32 {
        self.gpu_id
    }

    /// Free memory: total minus reservations and system reserve, floored at
    /// zero.
    pub fn free_memory(&self) -> f64 {
        self.state.lock().free_memory()
    }

    /// Free memory after also holding back the safety margin.
    pub fn available_memory(&self) -> f64 {
        self.state.lock().available_memory(self.safety_margin)
    }

    pub fn allocated_memory(&self) -> f64 {
        self.state.lock().allocated_memory
    }

    /// Whether `size` GB could be reserved right now.
    pub fn can_allocate(&self, size: f64) -> bool {
        match self.state.try_lock_for(self.lock_timeout) {
            Some(state) => state.available_memory(self.safety_margin) >= size,
            None => {
                error!(gpu_id = self.gpu_id, "pool lock timed out during can_allocate");
                false
            }
        }
    }

    /// Atomically reserve `size` GB. Returns false without change when the
    /// pool cannot fit the request or the lock could not be taken in time.
    pub fn allocate(&self, size: f64) -> bool {
        let Some(mut state) = self.state.try_lock_for(self.lock_timeout) else {
            error!(gpu_id = self.gpu_id, "pool lock timed out during allocate");
            return false;
        };
        let available = state.available_memory(self.safety_margin);
        if available >= size {
            state.allocated_memory += size;
            let remaining = state.available_memory(self.safety_margin);
            info!(
                gpu_id = self.gpu_id,
                size, remaining, "reserved pool memory"
            );
            true
        } else {
            debug!(
                gpu_id = self.gpu_id,
                size, available, "pool cannot fit reservation"
            );
            false
        }
    }

    /// Return `size` GB to the pool, floored at zero. Releasing memory that
    /// was never reserved is a no-op beyond the floor.
    pub fn release(&self, size: f64) {
        let Some(mut state) = self.state.try_lock_for(self.lock_timeout) else {
            error!(gpu_id = self.gpu_id, "pool lock timed out during release");
            return;
        };
        let before = state.allocated_memory;
        state.allocated_memory = (state.allocated_memory - size).max(0.0);
        info!(
            gpu_id = self.gpu_id,
            size,
            before,
            after = state.allocated_memory,
            "released pool memory"
        );
    }

    /// Reconcile the ledger with driver-observed usage so long-lived
    /// external processes show up between cycles.
    pub fn sync_from_hardware(&self, snapshot: &GpuSnapshot) {
        let Some(mut state) = self.state.try_lock_for(self.lock_timeout) else {
            error!(gpu_id = self.gpu_id, "pool lock timed out during hardware sync");
            return;
        };
        state.total_memory = snapshot.total_memory;
        state.allocated_memory = snapshot.used_memory;
        debug!(
            gpu_id = self.gpu_id,
            allocated = state.allocated_memory,
            "pool synced from hardware"
        );
    }

    /// Remember a refined estimate for a model on this device.
    pub fn update_model_estimate(&self, model: &str, estimated: f64) {
        if let Some(mut state) = self.state.try_lock_for(self.lock_timeout) {
            state.model_estimates.insert(model.to_string(), estimated);
        }
    }

    pub fn model_estimate(&self, model: &str) -> Option<f64> {
        self.state
            .try_lock_for(self.lock_timeout)
            .and_then(|state| state.model_estimates.get(model).copied())
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            gpu_id: self.gpu_id,
            total_memory: state.total_memory,
            reserved_memory: state.reserved_memory,
            allocated_memory: state.allocated_memory,
            free_memory: state.free_memory(),
            available_memory: state.available_memory(self.safety_margin),
        }
    }
}

/// Registry of pools keyed by GPU id, created lazily as devices appear.
#[derive(Debug)]
pub struct PoolSet {
    safety_margin: f64,
    reserved_memory: f64,
    pools: RwLock<HashMap<u32, Arc<GpuMemoryPool>>>,
}

impl PoolSet {
    pub fn new(safety_margin: f64, reserved_memory: f64) -> Self {
        Self {
            safety_margin,
            reserved_memory,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Pool for a device, creating it from the snapshot on first sight.
    pub fn ensure(&self, snapshot: &GpuSnapshot) -> Arc<GpuMemoryPool> {
        if let Some(pool) = self.pools.read().get(&snapshot.id) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(snapshot.id).or_insert_with(|| {
            info!(
                gpu_id = snapshot.id,
                total = snapshot.total_memory,
                "initializing memory pool"
            );
            Arc::new(GpuMemoryPool::new(
                snapshot.id,
                snapshot.total_memory,
                self.reserved_memory,
                self.safety_margin,
            ))
        }))
    }

    pub fn get(&self, gpu_id: u32) -> Option<Arc<GpuMemoryPool>> {
        self.pools.read().get(&gpu_id).cloned()
    }

    /// Pools in ascending device order.
    pub fn all(&self) -> Vec<Arc<GpuMemoryPool>> {
        let mut pools: Vec<_> = self.pools.read().values().cloned().collect();
        pools.sort_by_key(|p| p.gpu_id());
        pools
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Reconcile every known pool with a fresh set of snapshots, creating
    /// pools for newly visible devices.
    pub fn sync_all(&self, snapshots: &[GpuSnapshot]) {
        for snapshot in snapshots {
            let pool = self.ensure(snapshot);
            pool.sync_from_hardware(snapshot);
        }
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        self.all().iter().map(|p| p.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_16gb() -> GpuMemoryPool {
        // 16 GB total, no reserve, 10% safety margin: 14.4 GB available.
        GpuMemoryPool::new(0, 16.0, 0.0, 0.10)
    }

    #[test]
    fn available_memory_subtracts_margin() {
        let pool = pool_16gb();
        assert!((pool.available_memory() - 14.4).abs() < 1e-9);
        assert!((pool.free_memory() - 16.0).abs() < 1e-9);
    }

    #[test]
    fn allocate_and_release_round_trip() {
        let pool = pool_16gb();
        assert!(pool.allocate(2.0));
        assert!((pool.available_memory() - 12.4).abs() < 1e-9);
        pool.release(2.0);
        assert!((pool.available_memory() - 14.4).abs() < 1e-9);
    }

    #[test]
    fn allocation_fails_without_change_when_full() {
        let pool = pool_16gb();
        assert!(pool.allocate(10.0));
        // 4.4 GB available; a second large model cannot fit.
        assert!(!pool.allocate(10.0));
        assert!((pool.allocated_memory() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn release_is_floored_at_zero() {
        let pool = pool_16gb();
        pool.release(5.0);
        assert_eq!(pool.allocated_memory(), 0.0);
        assert!(pool.can_allocate(14.0));
    }

    #[test]
    fn sync_reflects_external_usage() {
        let pool = pool_16gb();
        let snapshot = GpuSnapshot {
            id: 0,
            name: "Fake".into(),
            total_memory: 16.0,
            used_memory: 6.0,
            free_memory: 10.0,
            temperature: None,
            utilization_gpu: None,
            utilization_memory: None,
        };
        pool.sync_from_hardware(&snapshot);
        assert!((pool.allocated_memory() - 6.0).abs() < 1e-9);
        assert!((pool.available_memory() - 8.4).abs() < 1e-9);
    }

    #[test]
    fn pool_set_creates_once_and_sorts() {
        let set = PoolSet::new(0.10, 0.0);
        let snap = |id| GpuSnapshot {
            id,
            name: format!("GPU {id}"),
            total_memory: 16.0,
            used_memory: 0.0,
            free_memory: 16.0,
            temperature: None,
            utilization_gpu: None,
            utilization_memory: None,
        };
        let first = set.ensure(&snap(1));
        let again = set.ensure(&snap(1));
        assert!(Arc::ptr_eq(&first, &again));
        set.ensure(&snap(0));
        let ids: Vec<u32> = set.all().iter().map(|p| p.gpu_id()).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
