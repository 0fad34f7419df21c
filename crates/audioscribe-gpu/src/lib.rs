//! GPU inventory and per-device memory pools.
//!
//! The inventory reports hardware truth through driver queries only — no
//! compute context is ever created in the parent process, which keeps the
//! per-task worker processes free to initialize their own. Pools are the
//! scheduler-owned ledger of reservations layered on top of that truth.

mod inventory;
mod pool;

pub use inventory::{best_available, GpuProbe, GpuSnapshot, NvmlProbe};
pub use pool::{GpuMemoryPool, PoolSet, PoolStatus};
