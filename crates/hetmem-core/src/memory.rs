//! Device memory abstractions.
//!
//! This module provides the allocator seam between the memory core and the
//! devices it manages: raw device pointers, RAII device buffers, and the
//! per-device allocator trait.

use std::fmt;

use crate::error::Result;

/// Raw address of a device (or unified-memory) allocation.
///
/// Stored as `usize` for FFI compatibility. The core never dereferences a
/// `DevicePtr`; only execution backends do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(usize);

impl DevicePtr {
    /// The null pointer.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Create a pointer from a raw address.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Create a pointer from a host raw pointer.
    pub fn from_raw<T>(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }

    /// Get the raw address.
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Check if null.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reinterpret as a typed host pointer.
    ///
    /// Only meaningful for devices whose memory is host addressable.
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Reinterpret as a typed const host pointer.
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Trait for a device memory region.
///
/// Dropping the buffer releases the memory. [`DeviceBuffer::into_raw`]
/// gives up ownership without releasing it.
pub trait DeviceBuffer: Send + Sync {
    /// Get buffer size in bytes.
    fn size(&self) -> usize;

    /// Get device pointer.
    fn device_ptr(&self) -> DevicePtr;

    /// Relinquish ownership; the memory is not freed when this returns.
    fn into_raw(self: Box<Self>) -> DevicePtr;
}

/// Trait for device memory allocation.
pub trait DeviceMemory: Send + Sync {
    /// Allocate device memory.
    fn allocate(&self, size: usize) -> Result<Box<dyn DeviceBuffer>> {
        self.allocate_aligned(size, align::GPU_CACHE_LINE_SIZE)
    }

    /// Allocate device memory with alignment.
    fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Box<dyn DeviceBuffer>>;

    /// Allocate zero-initialized device memory.
    ///
    /// Allocators that cannot zero cheaply may fall back to
    /// [`DeviceMemory::allocate_aligned`].
    fn allocate_zeroed(&self, size: usize, alignment: usize) -> Result<Box<dyn DeviceBuffer>> {
        self.allocate_aligned(size, alignment)
    }

    /// Get total device memory.
    fn total_memory(&self) -> usize;

    /// Get free device memory.
    fn free_memory(&self) -> usize;
}

/// Alignment utilities.
pub mod align {
    /// Cache line size (64 bytes on most modern CPUs).
    pub const CACHE_LINE_SIZE: usize = 64;

    /// GPU cache line size (128 bytes on many GPUs).
    pub const GPU_CACHE_LINE_SIZE: usize = 128;

    /// Align a value up to the next multiple of alignment.
    #[inline]
    pub const fn align_up(value: usize, alignment: usize) -> usize {
        let mask = alignment - 1;
        (value + mask) & !mask
    }

    /// Check if a value is aligned.
    #[inline]
    pub const fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }

    /// Check if an alignment is usable (non-zero power of two).
    #[inline]
    pub const fn is_valid_alignment(alignment: usize) -> bool {
        alignment.is_power_of_two()
    }
}
