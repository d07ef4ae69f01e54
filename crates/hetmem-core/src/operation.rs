//! Operations: recorded units of dependency-tracked work.
//!
//! An [`Operation`] is a cheap, reference-counted handle. Predecessor edges
//! are held strongly only until the operation is submitted; after that the
//! backend owns the ordering through predecessor events, and the operation
//! keeps just the predecessor ids for introspection.
//!
//! State machine: `Pending -> Submitted -> Completed | Failed`. A pending
//! operation may also be discarded, which moves it straight to `Failed`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::array::ArrayId;
use crate::backend::{EventHandle, EventStatus, ExecutionBackend, Submission, Work};
use crate::device::DeviceId;
use crate::error::{HetmemError, Result};
use crate::memory::DevicePtr;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique operation identifier. Ids increase in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Create an id from a raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    fn generate() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Recorded, not yet handed to the backend.
    Pending,
    /// Handed to the backend.
    Submitted,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or discarded.
    Failed,
}

impl OperationState {
    /// Check if the operation has at least been submitted.
    pub fn is_submitted(&self) -> bool {
        !matches!(self, OperationState::Pending)
    }

    /// Check if the operation has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }
}

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Caller work on tracked arrays.
    Kernel,
    /// Copy of current data to a stale device.
    Migration,
    /// Deferred copy of host seed data.
    Upload,
    /// Copy back into an external allocation at release.
    Writeback,
    /// Explicit validity update without a kernel.
    Update,
    /// Caller work on raw pointers, ordered only by declared predecessors.
    Untracked,
}

impl OperationKind {
    /// Internal operations carry their own work and are submitted by the core.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            OperationKind::Migration
                | OperationKind::Upload
                | OperationKind::Writeback
                | OperationKind::Update
        )
    }
}

/// Access mode requested on a managed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read current contents.
    Read,
    /// Overwrite contents; previous contents are discarded.
    Write,
    /// Read then modify current contents.
    ReadWrite,
}

impl AccessMode {
    /// Whether this access observes existing contents.
    pub fn reads(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether this access produces new contents.
    pub fn writes(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    /// Two accesses conflict if at least one of them writes.
    pub fn conflicts_with(&self, other: AccessMode) -> bool {
        self.writes() || other.writes()
    }
}

/// How an operation reaches memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    /// Through a managed array; ordered automatically.
    Tracked {
        /// Array accessed.
        array: ArrayId,
        /// Access mode.
        mode: AccessMode,
    },
    /// Through raw pointers; ordered only by declared predecessors.
    Untracked {
        /// Pointers touched by the work.
        pointers: Vec<DevicePtr>,
    },
}

/// One access performed by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDescriptor {
    /// Device the access happens on.
    pub device: DeviceId,
    /// Access path.
    pub path: AccessPath,
}

impl AccessDescriptor {
    /// Array targeted by a tracked access.
    pub fn array(&self) -> Option<ArrayId> {
        match &self.path {
            AccessPath::Tracked { array, .. } => Some(*array),
            AccessPath::Untracked { .. } => None,
        }
    }
}

struct OperationInner {
    state: OperationState,
    accesses: Vec<AccessDescriptor>,
    predecessors: Vec<Operation>,
    predecessor_ids: Vec<OperationId>,
    dependents: usize,
    event: Option<EventHandle>,
    work: Option<Work>,
    discarded: bool,
}

struct OperationNode {
    id: OperationId,
    kind: OperationKind,
    device: DeviceId,
    inner: Mutex<OperationInner>,
}

/// Handle on a recorded unit of work.
#[derive(Clone)]
pub struct Operation {
    node: Arc<OperationNode>,
}

impl Operation {
    pub(crate) fn new(kind: OperationKind, device: DeviceId) -> Self {
        Self::with_work(kind, device, None)
    }

    pub(crate) fn internal(kind: OperationKind, device: DeviceId, work: Work) -> Self {
        Self::with_work(kind, device, Some(work))
    }

    fn with_work(kind: OperationKind, device: DeviceId, work: Option<Work>) -> Self {
        let id = OperationId::generate();
        trace!(op = %id, ?kind, %device, "operation recorded");
        Self {
            node: Arc::new(OperationNode {
                id,
                kind,
                device,
                inner: Mutex::new(OperationInner {
                    state: OperationState::Pending,
                    accesses: Vec::new(),
                    predecessors: Vec::new(),
                    predecessor_ids: Vec::new(),
                    dependents: 0,
                    event: None,
                    work,
                    discarded: false,
                }),
            }),
        }
    }

    /// Operation id.
    pub fn id(&self) -> OperationId {
        self.node.id
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.node.kind
    }

    /// Device the operation executes on.
    pub fn device(&self) -> DeviceId {
        self.node.device
    }

    /// Current state, refreshed from the backend event.
    pub fn state(&self) -> OperationState {
        let mut inner = self.node.inner.lock();
        Self::refresh(&mut inner);
        inner.state
    }

    /// Check if the operation has finished (completed or failed).
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// Check if the operation was discarded.
    pub fn is_discarded(&self) -> bool {
        self.node.inner.lock().discarded
    }

    /// Ids of the operation's predecessors, in ascending order.
    pub fn predecessors(&self) -> Vec<OperationId> {
        let inner = self.node.inner.lock();
        let mut ids = inner.predecessor_ids.clone();
        ids.sort_unstable();
        ids
    }

    /// Accesses performed by the operation.
    pub fn accesses(&self) -> Vec<AccessDescriptor> {
        self.node.inner.lock().accesses.clone()
    }

    /// Number of operations that recorded a dependency on this one.
    pub fn dependents(&self) -> usize {
        self.node.inner.lock().dependents
    }

    /// Backend event, once submitted.
    pub fn event(&self) -> Option<EventHandle> {
        self.node.inner.lock().event.clone()
    }

    fn refresh(inner: &mut OperationInner) {
        if inner.state == OperationState::Submitted {
            if let Some(event) = &inner.event {
                match event.status() {
                    EventStatus::Running => {}
                    EventStatus::Complete => inner.state = OperationState::Completed,
                    EventStatus::Failed(_) => inner.state = OperationState::Failed,
                }
            }
        }
    }

    pub(crate) fn add_access(&self, access: AccessDescriptor) {
        self.node.inner.lock().accesses.push(access);
    }

    pub(crate) fn accesses_array(&self, array: ArrayId) -> bool {
        self.node
            .inner
            .lock()
            .accesses
            .iter()
            .any(|a| a.array() == Some(array))
    }

    /// Fail unless the operation is still pending.
    pub(crate) fn ensure_pending(&self, to: OperationState) -> Result<()> {
        let state = self.state();
        if state == OperationState::Pending {
            Ok(())
        } else {
            Err(HetmemError::InvalidStateTransition {
                op: self.id(),
                from: state,
                to,
            })
        }
    }

    /// Check whether `self` is reachable from `pred` through pending edges,
    /// i.e. whether the edge `self -> pred` would close a cycle.
    pub(crate) fn would_cycle(&self, pred: &Operation) -> bool {
        if pred.id() == self.id() {
            return true;
        }
        if self.dependents() == 0 {
            return false;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![pred.clone()];
        while let Some(op) = stack.pop() {
            if op.id() == self.id() {
                return true;
            }
            if !seen.insert(op.id()) {
                continue;
            }
            // Submitted operations only depend on submitted operations,
            // so the search never needs to go past them.
            let inner = op.node.inner.lock();
            if inner.state == OperationState::Pending {
                stack.extend(inner.predecessors.iter().cloned());
            }
        }
        false
    }

    /// Record a dependency edge `self -> pred`.
    ///
    /// Edges to completed predecessors are dropped, edges to discarded ones
    /// are refused.
    pub(crate) fn add_predecessor(&self, pred: &Operation) -> Result<()> {
        if self.would_cycle(pred) {
            return Err(HetmemError::DependencyCycle {
                op: self.id(),
                predecessor: pred.id(),
            });
        }
        let mut inner = self.node.inner.lock();
        if inner.state != OperationState::Pending {
            return Err(HetmemError::InvalidStateTransition {
                op: self.id(),
                from: inner.state,
                to: OperationState::Pending,
            });
        }
        if inner.predecessor_ids.contains(&pred.id()) {
            return Ok(());
        }
        {
            let mut pred_inner = pred.node.inner.lock();
            if pred_inner.discarded {
                return Err(HetmemError::DiscardRejected {
                    op: pred.id(),
                    reason: "operation was discarded".to_string(),
                });
            }
            Self::refresh(&mut pred_inner);
            if pred_inner.state == OperationState::Completed {
                return Ok(());
            }
            pred_inner.dependents += 1;
        }
        inner.predecessor_ids.push(pred.id());
        inner.predecessors.push(pred.clone());
        Ok(())
    }

    /// Submit caller work.
    pub(crate) fn submit(&self, backend: &dyn ExecutionBackend, work: Work) -> Result<EventHandle> {
        let mut inner = self.node.inner.lock();
        if inner.state != OperationState::Pending || inner.discarded {
            return Err(HetmemError::InvalidStateTransition {
                op: self.id(),
                from: inner.state,
                to: OperationState::Submitted,
            });
        }
        let events = self.predecessor_events(&inner, backend)?;
        self.submit_locked(&mut inner, backend, work, events)
    }

    /// Submit an internal operation if all direct predecessors are submitted.
    ///
    /// Returns whether the operation is now submitted.
    pub(crate) fn try_submit(&self, backend: &dyn ExecutionBackend) -> Result<bool> {
        let mut inner = self.node.inner.lock();
        if inner.state != OperationState::Pending {
            return Ok(true);
        }
        if inner.work.is_none() {
            return Ok(false);
        }
        if !inner.predecessors.iter().all(|p| p.state().is_submitted()) {
            return Ok(false);
        }
        let events = self.predecessor_events(&inner, backend)?;
        match inner.work.take() {
            Some(work) => {
                self.submit_locked(&mut inner, backend, work, events)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Event of this operation, submitting it first if it is internal.
    ///
    /// `dependent` names the operation that needs the event, for errors.
    pub(crate) fn submitted_event(
        &self,
        dependent: OperationId,
        backend: &dyn ExecutionBackend,
    ) -> Result<EventHandle> {
        let mut inner = self.node.inner.lock();
        if inner.state == OperationState::Pending {
            if inner.work.is_none() {
                return Err(HetmemError::PredecessorNotSubmitted {
                    op: dependent,
                    predecessor: self.id(),
                });
            }
            let events = self.predecessor_events(&inner, backend)?;
            if let Some(work) = inner.work.take() {
                return self.submit_locked(&mut inner, backend, work, events);
            }
        }
        match &inner.event {
            Some(event) => Ok(event.clone()),
            None => Err(HetmemError::BackendError(format!(
                "{} failed before submission",
                self.id()
            ))),
        }
    }

    fn predecessor_events(
        &self,
        inner: &OperationInner,
        backend: &dyn ExecutionBackend,
    ) -> Result<Vec<EventHandle>> {
        inner
            .predecessors
            .iter()
            .map(|pred| pred.submitted_event(self.id(), backend))
            .collect()
    }

    fn submit_locked(
        &self,
        inner: &mut OperationInner,
        backend: &dyn ExecutionBackend,
        work: Work,
        events: Vec<EventHandle>,
    ) -> Result<EventHandle> {
        let label = work.label();
        let submission = Submission::new(self.id(), self.device(), work).depends_on(events);
        match backend.submit(submission) {
            Ok(event) => {
                debug!(op = %self.id(), kind = ?self.kind(), work = label, backend = backend.name(), "submitted");
                inner.state = OperationState::Submitted;
                inner.event = Some(event.clone());
                inner.predecessors.clear();
                Ok(event)
            }
            Err(e) => {
                inner.state = OperationState::Failed;
                inner.predecessors.clear();
                Err(e)
            }
        }
    }

    /// Discard a pending operation nobody depends on.
    pub(crate) fn discard(&self) -> Result<()> {
        let preds = {
            let mut inner = self.node.inner.lock();
            if inner.state != OperationState::Pending || inner.discarded {
                return Err(HetmemError::DiscardRejected {
                    op: self.id(),
                    reason: format!("operation is {:?}", inner.state),
                });
            }
            if inner.dependents > 0 {
                return Err(HetmemError::DiscardRejected {
                    op: self.id(),
                    reason: format!("{} operation(s) depend on it", inner.dependents),
                });
            }
            inner.discarded = true;
            inner.state = OperationState::Failed;
            inner.work = None;
            std::mem::take(&mut inner.predecessors)
        };
        for pred in preds {
            let mut pred_inner = pred.node.inner.lock();
            pred_inner.dependents = pred_inner.dependents.saturating_sub(1);
        }
        debug!(op = %self.id(), "discarded");
        Ok(())
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Operation {}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("device", &self.device())
            .field("state", &self.state())
            .finish()
    }
}
