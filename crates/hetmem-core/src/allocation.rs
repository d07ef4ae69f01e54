//! Allocation registry.
//!
//! Holds at most one physical allocation per (array, device) pair. Owned
//! allocations are created lazily through the device's allocator and freed
//! when the registry is dropped; external allocations are caller supplied
//! and never freed. Once registered, an allocation never moves.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::array::ArrayId;
use crate::config::RuntimeConfig;
use crate::device::{DeviceId, DeviceSet};
use crate::error::{HetmemError, Result};
use crate::memory::{align, DeviceBuffer, DevicePtr};

/// Who is responsible for freeing an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Freed by the runtime when the array's storage is reclaimed.
    Owned,
    /// Supplied by (or handed to) the caller; never freed by the runtime.
    External,
}

/// Physical memory backing an array on one device.
pub struct DeviceAllocation {
    ptr: DevicePtr,
    buffer: Option<Box<dyn DeviceBuffer>>,
}

impl DeviceAllocation {
    fn owned(buffer: Box<dyn DeviceBuffer>) -> Self {
        Self {
            ptr: buffer.device_ptr(),
            buffer: Some(buffer),
        }
    }

    fn external(ptr: DevicePtr) -> Self {
        Self { ptr, buffer: None }
    }

    /// Device pointer.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Ownership mode.
    pub fn ownership(&self) -> Ownership {
        if self.buffer.is_some() {
            Ownership::Owned
        } else {
            Ownership::External
        }
    }
}

impl std::fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("ptr", &self.ptr)
            .field("ownership", &self.ownership())
            .finish()
    }
}

/// Diagnostic view of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Device holding the allocation.
    pub device: DeviceId,
    /// Device pointer.
    pub pointer: DevicePtr,
    /// Logical size in bytes.
    pub size: usize,
    /// Ownership mode.
    pub ownership: Ownership,
}

/// All allocations of one array.
#[derive(Debug)]
pub struct AllocationRegistry {
    array: ArrayId,
    size: usize,
    slots: BTreeMap<DeviceId, DeviceAllocation>,
}

impl AllocationRegistry {
    /// Create an empty registry for an array of `size` bytes.
    pub fn new(array: ArrayId, size: usize) -> Self {
        Self {
            array,
            size,
            slots: BTreeMap::new(),
        }
    }

    /// Logical size of every allocation in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer on `device`, if an allocation exists.
    pub fn get(&self, device: DeviceId) -> Option<DevicePtr> {
        self.slots.get(&device).map(DeviceAllocation::ptr)
    }

    /// Ownership of the allocation on `device`, if one exists.
    pub fn ownership(&self, device: DeviceId) -> Option<Ownership> {
        self.slots.get(&device).map(DeviceAllocation::ownership)
    }

    /// Number of allocations.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no allocation exists.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of owned allocations.
    pub fn owned_count(&self) -> usize {
        self.slots
            .values()
            .filter(|a| a.ownership() == Ownership::Owned)
            .count()
    }

    /// Bytes held by owned allocations.
    pub fn owned_bytes(&self) -> usize {
        self.owned_count() * self.size
    }

    /// Devices whose allocation is caller supplied.
    pub fn external_devices(&self) -> Vec<DeviceId> {
        self.slots
            .iter()
            .filter(|(_, a)| a.ownership() == Ownership::External)
            .map(|(&d, _)| d)
            .collect()
    }

    /// Return the allocation on `device`, allocating it on first use.
    ///
    /// The second element reports whether a new allocation was made.
    /// On failure nothing is recorded.
    pub fn materialize(
        &mut self,
        device: DeviceId,
        devices: &DeviceSet,
        config: &RuntimeConfig,
    ) -> Result<(DevicePtr, bool)> {
        if let Some(ptr) = self.get(device) {
            return Ok((ptr, false));
        }
        let memory = devices.memory(device)?;
        let bytes = align::align_up(self.size.max(1), config.alignment);
        let result = if config.zero_fill {
            memory.allocate_zeroed(bytes, config.alignment)
        } else {
            memory.allocate_aligned(bytes, config.alignment)
        };
        let buffer = result.map_err(|e| match e {
            HetmemError::AllocationFailure { reason, .. } => HetmemError::AllocationFailure {
                device,
                size: bytes,
                reason,
            },
            other => HetmemError::AllocationFailure {
                device,
                size: bytes,
                reason: other.to_string(),
            },
        })?;
        let allocation = DeviceAllocation::owned(buffer);
        let ptr = allocation.ptr();
        debug!(array = %self.array, %device, bytes, ptr = %ptr, "allocation materialized");
        self.slots.insert(device, allocation);
        Ok((ptr, true))
    }

    /// Register a caller-supplied pointer for `device`.
    pub fn embed(&mut self, device: DeviceId, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Err(HetmemError::NullPointer {
                array: self.array,
                device,
            });
        }
        if self.slots.contains_key(&device) {
            return Err(HetmemError::AllocationConflict {
                array: self.array,
                device,
            });
        }
        trace!(array = %self.array, %device, ptr = %ptr, "pointer embedded");
        self.slots.insert(device, DeviceAllocation::external(ptr));
        Ok(())
    }

    /// Hand ownership of the allocation on `device` to the caller.
    ///
    /// Returns the number of bytes no longer owned by the runtime; zero if
    /// the allocation was already external or does not exist.
    pub fn disown(&mut self, device: DeviceId) -> usize {
        let Some(slot) = self.slots.get_mut(&device) else {
            return 0;
        };
        match slot.buffer.take() {
            Some(buffer) => {
                let ptr = buffer.into_raw();
                debug!(array = %self.array, %device, ptr = %ptr, "allocation disowned");
                self.size
            }
            None => 0,
        }
    }

    /// Snapshot of every allocation, in registration order.
    pub fn infos(&self) -> Vec<AllocationInfo> {
        self.slots
            .iter()
            .map(|(&device, a)| AllocationInfo {
                device,
                pointer: a.ptr(),
                size: self.size,
                ownership: a.ownership(),
            })
            .collect()
    }
}
