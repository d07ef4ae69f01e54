//! Runtime statistics.
//!
//! Counters are plain atomics updated on the request path; a
//! [`RuntimeStatsSnapshot`] gives a consistent-enough copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of a memory runtime.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    arrays_created: AtomicU64,
    arrays_released: AtomicU64,
    arrays_collected: AtomicU64,
    allocations: AtomicU64,
    allocations_freed: AtomicU64,
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    migrations: AtomicU64,
    uploads: AtomicU64,
    writebacks: AtomicU64,
    operations_submitted: AtomicU64,
    operations_discarded: AtomicU64,
}

impl RuntimeStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track_array_created(&self) {
        self.arrays_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_array_released(&self) {
        self.arrays_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_array_collected(&self) {
        self.arrays_collected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let new_bytes = self.current_bytes.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.peak_bytes.fetch_max(new_bytes, Ordering::Relaxed);
    }

    /// Owned bytes no longer held by the runtime (freed or disowned).
    pub(crate) fn track_release_bytes(&self, bytes: usize) {
        self.current_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn track_free(&self, count: usize, bytes: usize) {
        self.allocations_freed.fetch_add(count as u64, Ordering::Relaxed);
        self.track_release_bytes(bytes);
    }

    pub(crate) fn track_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_writebacks(&self, count: usize) {
        self.writebacks.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn track_submitted(&self) {
        self.operations_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_discarded(&self) {
        self.operations_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get bytes currently held in owned allocations.
    pub fn current_usage(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Get peak bytes held in owned allocations.
    pub fn peak_usage(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> RuntimeStatsSnapshot {
        RuntimeStatsSnapshot {
            arrays_created: self.arrays_created.load(Ordering::Relaxed),
            arrays_released: self.arrays_released.load(Ordering::Relaxed),
            arrays_collected: self.arrays_collected.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            allocations_freed: self.allocations_freed.load(Ordering::Relaxed),
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            operations_submitted: self.operations_submitted.load(Ordering::Relaxed),
            operations_discarded: self.operations_discarded.load(Ordering::Relaxed),
        }
    }

    /// Reset peak usage to current usage.
    pub fn reset_peak(&self) {
        let current = self.current_bytes.load(Ordering::Relaxed);
        self.peak_bytes.store(current, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RuntimeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStatsSnapshot {
    /// Arrays created.
    pub arrays_created: u64,
    /// Arrays released by the caller.
    pub arrays_released: u64,
    /// Released arrays whose storage has been reclaimed.
    pub arrays_collected: u64,
    /// Owned allocations made.
    pub allocations: u64,
    /// Owned allocations freed.
    pub allocations_freed: u64,
    /// Bytes currently held in owned allocations.
    pub current_bytes: u64,
    /// Peak bytes held in owned allocations.
    pub peak_bytes: u64,
    /// Device-to-device migrations queued.
    pub migrations: u64,
    /// Host seed uploads queued.
    pub uploads: u64,
    /// Release-time writebacks queued.
    pub writebacks: u64,
    /// Caller operations handed to the backend (kernels and untracked work).
    pub operations_submitted: u64,
    /// Operations discarded before submission.
    pub operations_discarded: u64,
}
