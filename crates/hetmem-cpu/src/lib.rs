//! CPU backend for hetmem.
//!
//! This crate provides an execution backend that runs work on the host and
//! a host-heap allocator for simulated devices. It is useful for:
//!
//! - Development and testing without GPU hardware
//! - Fallback when no accelerator is available
//! - Exercising migration, writeback and release paths end to end
//!
//! ## Example
//!
//! ```ignore
//! use hetmem_cpu::{simulated_device_set, CpuBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let devices = simulated_device_set(2, 64 << 20).unwrap();
//!     let backend = CpuBackend::new().unwrap();
//! }
//! ```

#![warn(missing_docs)]

mod backend;
mod memory;

pub use backend::{CpuBackend, CpuBackendMetrics};
pub use memory::{HostBuffer, HostMemory};

use std::sync::Arc;

use hetmem_core::device::{DeviceInfo, DeviceKind, DeviceSet};
use hetmem_core::error::Result;

/// Host device plus `gpus` simulated GPUs, each with a `capacity`-byte budget.
///
/// The host is registered first, so it has id 0.
pub fn simulated_device_set(gpus: usize, capacity: usize) -> Result<DeviceSet> {
    let mut builder = DeviceSet::builder().device(
        DeviceInfo::new("host", DeviceKind::Host),
        Arc::new(HostMemory::new(capacity)),
    );
    for i in 0..gpus {
        builder = builder.device(
            DeviceInfo::new(format!("sim-gpu{}", i), DeviceKind::Gpu)
                .with_p2p(true)
                .with_unified_memory(true),
            Arc::new(HostMemory::new(capacity)),
        );
    }
    builder.build()
}
