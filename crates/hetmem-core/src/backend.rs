//! Execution backend interface.
//!
//! The memory core never executes work itself. It hands [`Submission`]s to
//! an [`ExecutionBackend`], which returns an [`EventHandle`] that completes
//! once the work has run. Predecessor events travel with the submission;
//! the backend must not start the work before all of them have completed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::device::DeviceId;
use crate::error::{HetmemError, Result};
use crate::memory::DevicePtr;
use crate::operation::OperationId;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Status of a submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Work has been accepted and has not finished.
    Running,
    /// Work finished successfully.
    Complete,
    /// Work failed.
    Failed(String),
}

impl EventStatus {
    /// Check if the status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Running)
    }
}

/// Handle on the completion of one submitted unit of work.
#[derive(Clone)]
pub struct EventHandle {
    id: u64,
    status: watch::Receiver<EventStatus>,
}

impl EventHandle {
    /// Create a running event and the completer that finishes it.
    pub fn pair() -> (EventHandle, EventCompleter) {
        let (tx, rx) = watch::channel(EventStatus::Running);
        let id = NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed);
        (
            EventHandle { id, status: rx },
            EventCompleter { id, status: Some(tx) },
        )
    }

    /// Create an event that has already completed.
    pub fn completed() -> EventHandle {
        let (event, completer) = Self::pair();
        completer.complete();
        event
    }

    /// Event identifier (unique per process).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> EventStatus {
        self.status.borrow().clone()
    }

    /// Check whether the work has finished (successfully or not).
    pub fn is_complete(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Wait for the work to finish.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(EventStatus::is_terminal)
            .await
            .map_err(|_| HetmemError::BackendError(format!("event {} abandoned", self.id)))?
            .clone();
        match status {
            EventStatus::Failed(reason) => Err(HetmemError::BackendError(reason)),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Backend-side completion of an [`EventHandle`].
///
/// Dropping a completer without finishing it fails the event.
pub struct EventCompleter {
    id: u64,
    status: Option<watch::Sender<EventStatus>>,
}

impl EventCompleter {
    /// Event identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the work as successfully finished.
    pub fn complete(mut self) {
        if let Some(tx) = self.status.take() {
            tx.send_replace(EventStatus::Complete);
        }
    }

    /// Mark the work as failed.
    pub fn fail(mut self, reason: impl Into<String>) {
        if let Some(tx) = self.status.take() {
            tx.send_replace(EventStatus::Failed(reason.into()));
        }
    }
}

impl Drop for EventCompleter {
    fn drop(&mut self) {
        if let Some(tx) = self.status.take() {
            tx.send_replace(EventStatus::Failed("work dropped before completion".to_string()));
        }
    }
}

/// Caller-supplied kernel body.
pub type KernelFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Device-to-device copy of a whole allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRequest {
    /// Device holding current data.
    pub src_device: DeviceId,
    /// Source allocation.
    pub src: DevicePtr,
    /// Device receiving the data.
    pub dst_device: DeviceId,
    /// Destination allocation.
    pub dst: DevicePtr,
    /// Number of bytes to copy.
    pub bytes: usize,
}

/// Copy of host seed data into a device allocation.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Seed bytes.
    pub data: Arc<[u8]>,
    /// Device receiving the data.
    pub dst_device: DeviceId,
    /// Destination allocation.
    pub dst: DevicePtr,
}

/// Work carried by a submission.
pub enum Work {
    /// Opaque caller work.
    Kernel(KernelFn),
    /// Migration or writeback copy.
    Copy(CopyRequest),
    /// Deferred host seed copy.
    Upload(UploadRequest),
    /// No data movement; completes once its predecessors have.
    Barrier,
}

impl Work {
    /// Wrap a closure as kernel work.
    pub fn kernel<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Work::Kernel(Box::new(f))
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Work::Kernel(_) => "kernel",
            Work::Copy(_) => "copy",
            Work::Upload(_) => "upload",
            Work::Barrier => "barrier",
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Kernel(_) => f.write_str("Kernel(..)"),
            Work::Copy(req) => f.debug_tuple("Copy").field(req).finish(),
            Work::Upload(req) => f
                .debug_struct("Upload")
                .field("bytes", &req.data.len())
                .field("dst_device", &req.dst_device)
                .field("dst", &req.dst)
                .finish(),
            Work::Barrier => f.write_str("Barrier"),
        }
    }
}

/// One unit of work handed to a backend.
#[derive(Debug)]
pub struct Submission {
    /// Operation the work belongs to.
    pub operation: OperationId,
    /// Device the work executes on.
    pub device: DeviceId,
    /// The work itself.
    pub work: Work,
    /// Events that must complete before the work starts.
    pub predecessors: Vec<EventHandle>,
}

impl Submission {
    /// Create a submission without predecessors.
    pub fn new(operation: OperationId, device: DeviceId, work: Work) -> Self {
        Self {
            operation,
            device,
            work,
            predecessors: Vec::new(),
        }
    }

    /// Add predecessor events.
    pub fn depends_on(mut self, events: impl IntoIterator<Item = EventHandle>) -> Self {
        self.predecessors.extend(events);
        self
    }
}

/// Execution backend consumed by the memory core.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Queue work for asynchronous execution.
    ///
    /// Must not block on device completion.
    fn submit(&self, submission: Submission) -> Result<EventHandle>;

    /// Wait for submitted work to finish.
    async fn wait(&self, event: &EventHandle) -> Result<()> {
        event.wait().await
    }
}
