//! CPU execution backend.
//!
//! Each submission becomes a tokio task that waits for its predecessor
//! events and then runs the work on the blocking pool. Copies and uploads
//! are plain memcpys, since every simulated device lives in host memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use hetmem_core::backend::{EventHandle, ExecutionBackend, Submission, Work};
use hetmem_core::error::{HetmemError, Result};

/// Counters of a [`CpuBackend`].
#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_copied: AtomicU64,
}

/// Snapshot of CPU backend activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuBackendMetrics {
    /// Submissions accepted.
    pub submitted: u64,
    /// Submissions finished successfully.
    pub completed: u64,
    /// Submissions that failed, including those whose predecessors failed.
    pub failed: u64,
    /// Bytes moved by copies and uploads.
    pub bytes_copied: u64,
}

impl CpuBackendMetrics {
    /// Submissions not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

/// Execution backend running work on the host.
pub struct CpuBackend {
    handle: Handle,
    counters: Arc<Counters>,
    shutdown: RwLock<bool>,
}

impl CpuBackend {
    /// Create a backend on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| HetmemError::BackendError(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(handle))
    }

    /// Create a backend spawning onto the given runtime.
    pub fn with_handle(handle: Handle) -> Self {
        info!("Initializing CPU execution backend");
        Self {
            handle,
            counters: Arc::new(Counters::default()),
            shutdown: RwLock::new(false),
        }
    }

    /// Get backend metrics.
    pub fn metrics(&self) -> CpuBackendMetrics {
        CpuBackendMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            bytes_copied: self.counters.bytes_copied.load(Ordering::Relaxed),
        }
    }

    /// Refuse further submissions. Work already accepted still runs.
    pub fn shutdown(&self) {
        let mut shutdown = self.shutdown.write();
        if !*shutdown {
            info!("Shutting down CPU execution backend");
            *shutdown = true;
        }
    }
}

/// Run one unit of work; returns the number of bytes moved.
fn execute(work: Work) -> Result<usize> {
    match work {
        Work::Kernel(f) => f().map(|()| 0),
        Work::Copy(req) => {
            if req.src.is_null() || req.dst.is_null() {
                return Err(HetmemError::TransferFailed(format!(
                    "null pointer in copy {} -> {}",
                    req.src_device, req.dst_device
                )));
            }
            if req.src != req.dst {
                // SAFETY: both pointers are allocations of the same array, at
                // least `bytes` long, on distinct devices; the runtime orders
                // this copy against every other access to either of them.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        req.src.as_ptr::<u8>(),
                        req.dst.as_mut_ptr::<u8>(),
                        req.bytes,
                    )
                };
            }
            Ok(req.bytes)
        }
        Work::Upload(req) => {
            if req.dst.is_null() {
                return Err(HetmemError::TransferFailed(format!(
                    "null upload target on {}",
                    req.dst_device
                )));
            }
            // SAFETY: dst is an allocation of the seeded array, which is
            // exactly `data.len()` bytes; nothing else touches it until the
            // upload completes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    req.data.as_ptr(),
                    req.dst.as_mut_ptr::<u8>(),
                    req.data.len(),
                )
            };
            Ok(req.data.len())
        }
        Work::Barrier => Ok(0),
    }
}

#[async_trait]
impl ExecutionBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn submit(&self, submission: Submission) -> Result<EventHandle> {
        if *self.shutdown.read() {
            return Err(HetmemError::BackendError(
                "CPU backend has been shut down".to_string(),
            ));
        }
        let (event, completer) = EventHandle::pair();
        let counters = Arc::clone(&self.counters);
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        let Submission {
            operation,
            device,
            work,
            predecessors,
        } = submission;
        let label = work.label();

        self.handle.spawn(async move {
            for pred in &predecessors {
                if let Err(e) = pred.wait().await {
                    warn!(op = %operation, "predecessor failed: {}", e);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    completer.fail(format!("{} predecessor failed: {}", operation, e));
                    return;
                }
            }

            match tokio::task::spawn_blocking(move || execute(work)).await {
                Ok(Ok(bytes)) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    counters
                        .bytes_copied
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                    debug!(op = %operation, %device, work = label, bytes, "work completed");
                    completer.complete();
                }
                Ok(Err(e)) => {
                    warn!(op = %operation, %device, work = label, "work failed: {}", e);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    completer.fail(e.to_string());
                }
                Err(e) => {
                    warn!(op = %operation, %device, work = label, "work panicked: {}", e);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    completer.fail(format!("{} panicked", operation));
                }
            }
        });
        Ok(event)
    }
}
