//! # hetmem Core
//!
//! Memory-management core for heterogeneous compute runtimes.
//!
//! The crate manages per-device allocations behind a managed-array
//! abstraction, tracks which devices hold current data, and orders
//! conflicting operations automatically. Low-level escape hatches (pointer
//! extraction and embedding, untracked submission, manual dependencies,
//! explicit validity updates) stay composable with the tracked path.
//!
//! ## Core Abstractions
//!
//! - [`MemoryRuntime`](runtime::MemoryRuntime) - Arrays, access requests and release
//! - [`DeviceSet`](device::DeviceSet) - Explicit list of compute targets
//! - [`Operation`](operation::Operation) - Dependency-tracked unit of work
//! - [`ExecutionBackend`](backend::ExecutionBackend) - Where submitted work runs
//! - [`DeviceMemory`](memory::DeviceMemory) - Per-device allocator seam
//!
//! ## Example
//!
//! ```ignore
//! use hetmem_core::prelude::*;
//!
//! let runtime = MemoryRuntime::new(devices, backend)?;
//! let array = runtime.create_array(
//!     ArrayDesc::new::<f32>([1 << 20]),
//!     BehaviorPolicy::async_buffer(),
//!     ArraySeed::Uninit,
//! )?;
//! let grant = runtime.request_access(&array, gpu, AccessMode::Write)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocation;
pub mod array;
pub mod backend;
pub mod config;
pub mod dependency;
pub mod device;
pub mod error;
pub mod memory;
pub mod operation;
pub mod runtime;
pub mod stats;
pub mod validity;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::allocation::{AllocationInfo, Ownership};
    pub use crate::array::{
        AccessGrant, ArrayDesc, ArrayHandle, ArrayId, ArraySeed, BehaviorPolicy, Destructor,
        Storage,
    };
    pub use crate::backend::{
        CopyRequest, EventCompleter, EventHandle, EventStatus, ExecutionBackend, KernelFn,
        Submission, UploadRequest, Work,
    };
    pub use crate::config::{load_config, parse_config, RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::device::{
        DeviceId, DeviceInfo, DeviceKind, DeviceSet, DeviceSetBuilder, InterconnectType,
        TopologyCostModel, TransferCostModel,
    };
    pub use crate::error::{HetmemError, Result};
    pub use crate::memory::{align, DeviceBuffer, DeviceMemory, DevicePtr};
    pub use crate::operation::{
        AccessDescriptor, AccessMode, AccessPath, Operation, OperationId, OperationKind,
        OperationState,
    };
    pub use crate::runtime::{MemoryRuntime, MemoryRuntimeBuilder, ReleaseHandle};
    pub use crate::stats::RuntimeStatsSnapshot;
}
