//! Host-heap device memory.
//!
//! Every simulated device gets its own [`HostMemory`] with a byte budget,
//! so allocation failure on one device can be exercised without touching
//! the others.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use hetmem_core::device::DeviceId;
use hetmem_core::error::{HetmemError, Result};
use hetmem_core::memory::{DeviceBuffer, DeviceMemory, DevicePtr};

/// Placeholder device in allocator errors; the registry fills in the real one.
const UNASSIGNED: DeviceId = DeviceId::new(u32::MAX);

/// Allocator carving device memory out of the host heap.
#[derive(Debug)]
pub struct HostMemory {
    capacity: usize,
    used: Arc<AtomicUsize>,
}

impl HostMemory {
    /// Create an allocator with a budget of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create an allocator limited only by the host.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| HetmemError::AllocationFailure {
                device: UNASSIGNED,
                size,
                reason: format!(
                    "out of memory ({} of {} bytes in use)",
                    used, self.capacity
                ),
            })
    }

    fn allocate_with(
        &self,
        size: usize,
        alignment: usize,
        zeroed: bool,
    ) -> Result<Box<dyn DeviceBuffer>> {
        let layout = Layout::from_size_align(size.max(1), alignment).map_err(|e| {
            HetmemError::AllocationFailure {
                device: UNASSIGNED,
                size,
                reason: e.to_string(),
            }
        })?;
        self.reserve(layout.size())?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe {
            if zeroed {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        let Some(ptr) = NonNull::new(raw) else {
            self.used.fetch_sub(layout.size(), Ordering::AcqRel);
            return Err(HetmemError::AllocationFailure {
                device: UNASSIGNED,
                size,
                reason: "host allocator returned null".to_string(),
            });
        };
        trace!(size = layout.size(), alignment, zeroed, "host buffer allocated");
        Ok(Box::new(HostBuffer {
            ptr,
            layout,
            owned: true,
            used: Arc::clone(&self.used),
        }))
    }
}

impl DeviceMemory for HostMemory {
    fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Box<dyn DeviceBuffer>> {
        self.allocate_with(size, alignment, false)
    }

    fn allocate_zeroed(&self, size: usize, alignment: usize) -> Result<Box<dyn DeviceBuffer>> {
        self.allocate_with(size, alignment, true)
    }

    fn total_memory(&self) -> usize {
        self.capacity
    }

    fn free_memory(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }
}

/// Heap block backing one simulated device allocation.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    owned: bool,
    used: Arc<AtomicUsize>,
}

impl DeviceBuffer for HostBuffer {
    fn size(&self) -> usize {
        self.layout.size()
    }

    fn device_ptr(&self) -> DevicePtr {
        DevicePtr::from_raw(self.ptr.as_ptr())
    }

    fn into_raw(mut self: Box<Self>) -> DevicePtr {
        self.owned = false;
        self.used.fetch_sub(self.layout.size(), Ordering::AcqRel);
        self.device_ptr()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: ptr was returned by the global allocator for this layout
            // and ownership was never handed out.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
            self.used.fetch_sub(self.layout.size(), Ordering::AcqRel);
        }
    }
}

// SAFETY: HostBuffer exclusively owns its heap block; the pointer is only
// dereferenced by work the runtime has ordered.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}
