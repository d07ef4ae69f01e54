//! # hetmem
//!
//! Managed arrays for heterogeneous compute runtimes.
//!
//! A managed array is one logical dataset that may have a physical
//! allocation on every device of a [`DeviceSet`]. The runtime allocates
//! lazily, tracks which allocations hold current data, queues migration
//! copies when a device needs data it does not have, and orders
//! conflicting operations automatically.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hetmem::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let runtime = HostRuntime::builder().gpus(2).build()?;
//!     let gpu = simulated_gpu(0);
//!
//!     let array = runtime.create_array(
//!         ArrayDesc::new::<f32>([1024]),
//!         BehaviorPolicy::sync_buffer(),
//!         ArraySeed::from_slice(&[1.0f32; 1024]),
//!     )?;
//!
//!     // Write on the GPU; the host copy goes stale.
//!     let grant = runtime.request_access(&array, gpu, AccessMode::Write)?;
//!     let ptr = grant.pointer;
//!     runtime.submit(&grant.operation, Work::kernel(move || {
//!         // ... launch a kernel on `ptr` ...
//!         Ok(())
//!     }))?;
//!
//!     // Reading on the host migrates the GPU contents back first.
//!     let read = runtime.request_access(&array, HOST_DEVICE, AccessMode::Read)?;
//!     runtime.submit(&read.operation, Work::kernel(|| Ok(())))?;
//!     runtime.wait(&read.operation).await?;
//!
//!     runtime.release(array).await?;
//!     runtime.shutdown().await
//! }
//! ```
//!
//! ## Crates
//!
//! - `hetmem-core` - Allocation registry, validity tracking, dependency
//!   graph, and the [`MemoryRuntime`]
//! - `hetmem-cpu` - Host execution backend and simulated device memory
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     MemoryRuntime                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │ ArrayState   │──│ Validity     │──│ AccessHistory  │  │
//! │  │ (per array)  │  │ Record       │  │ (dependencies) │  │
//! │  └──────┬───────┘  └──────────────┘  └────────────────┘  │
//! │         │ AllocationRegistry                             │
//! └─────────┼────────────────────────────────────────────────┘
//!           │ Submission (Kernel / Copy / Upload / Barrier)
//! ┌─────────┴────────────────────────────────────────────────┐
//! │                  ExecutionBackend                        │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

// Re-export core types
pub use hetmem_core::*;

// Re-export CPU backend (always available)
pub use hetmem_cpu::{simulated_device_set, CpuBackend, CpuBackendMetrics, HostMemory};

use std::sync::Arc;

use hetmem_core::config::RuntimeConfig;
use hetmem_core::device::DeviceId;
use hetmem_core::error::Result;
use hetmem_core::runtime::MemoryRuntime;
use tracing::info;

/// Device id of the host in a simulated device set.
pub const HOST_DEVICE: DeviceId = DeviceId::new(0);

/// Device id of the `index`-th simulated GPU.
pub const fn simulated_gpu(index: u32) -> DeviceId {
    DeviceId::new(index + 1)
}

/// Default per-device budget of a [`HostRuntime`] (256 MiB).
pub const DEFAULT_DEVICE_CAPACITY: usize = 256 << 20;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{simulated_gpu, HostRuntime, HostRuntimeBuilder, HOST_DEVICE};
    pub use hetmem_core::prelude::*;
    pub use hetmem_cpu::{CpuBackend, HostMemory};
}

/// Memory runtime on simulated devices, executed by the CPU backend.
pub struct HostRuntime;

impl HostRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }
}

/// Builder for a [`MemoryRuntime`] over host memory.
#[derive(Debug, Clone)]
pub struct HostRuntimeBuilder {
    gpus: usize,
    capacity: usize,
    config: RuntimeConfig,
}

impl HostRuntimeBuilder {
    /// Create a new builder: one simulated GPU, default budget and config.
    pub fn new() -> Self {
        Self {
            gpus: 1,
            capacity: DEFAULT_DEVICE_CAPACITY,
            config: RuntimeConfig::default(),
        }
    }

    /// Set the number of simulated GPUs.
    #[must_use]
    pub fn gpus(mut self, count: usize) -> Self {
        self.gpus = count;
        self
    }

    /// Set the memory budget of every device in bytes.
    #[must_use]
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    /// Set the runtime configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MemoryRuntime> {
        info!(
            "Building host runtime ({} simulated GPUs, {} bytes per device)",
            self.gpus, self.capacity
        );
        let devices = simulated_device_set(self.gpus, self.capacity)?;
        let backend = Arc::new(CpuBackend::new()?);
        MemoryRuntime::builder(devices, backend)
            .with_config(self.config)
            .build()
    }
}

impl Default for HostRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let runtime = HostRuntime::builder().build().unwrap();
        assert_eq!(runtime.devices().len(), 2);
        assert_eq!(runtime.backend().name(), "cpu");
        assert_eq!(runtime.devices().host(), Some(HOST_DEVICE));
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_config() {
        let config = RuntimeConfig {
            alignment: 48,
            ..RuntimeConfig::default()
        };
        assert!(HostRuntime::builder().config(config).build().is_err());
    }

    #[test]
    fn test_build_requires_tokio() {
        assert!(HostRuntime::builder().build().is_err());
    }

    #[test]
    fn test_simulated_gpu_ids() {
        assert_eq!(simulated_gpu(0), DeviceId::new(1));
        assert_eq!(simulated_gpu(3).index(), 4);
    }
}
