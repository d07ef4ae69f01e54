//! Managed arrays.
//!
//! A managed array is one logical dataset with a fixed byte size. It owns
//! an [`AllocationRegistry`], a [`ValidityRecord`] and an [`AccessHistory`],
//! and enforces the [`BehaviorPolicy`] chosen at construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::allocation::AllocationRegistry;
use crate::backend::{CopyRequest, UploadRequest, Work};
use crate::config::RuntimeConfig;
use crate::dependency::AccessHistory;
use crate::device::{DeviceId, DeviceSet};
use crate::error::{HetmemError, Result};
use crate::memory::DevicePtr;
use crate::operation::{
    AccessDescriptor, AccessMode, AccessPath, Operation, OperationId, OperationKind, OperationState,
};
use crate::validity::{MigrationSource, ValidityRecord};

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

/// Unique managed array identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(u64);

impl ArrayId {
    /// Create an id from a raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn generate() -> Self {
        Self(NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array#{}", self.0)
    }
}

/// Where an array's primary storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Runtime-allocated memory.
    Owned,
    /// Caller-supplied pointers.
    View,
}

/// What releasing an array waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destructor {
    /// Release waits for writebacks and outstanding operations.
    Blocking,
    /// Release returns immediately; storage is reclaimed later.
    NonBlocking,
}

/// Behavior of a managed array, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BehaviorPolicy {
    /// Storage mode.
    pub storage: Storage,
    /// Copy current data back into external allocations on release.
    pub writeback: bool,
    /// Release behavior.
    pub destructor: Destructor,
}

impl BehaviorPolicy {
    /// Owned storage, blocking release.
    pub const fn sync_buffer() -> Self {
        Self {
            storage: Storage::Owned,
            writeback: false,
            destructor: Destructor::Blocking,
        }
    }

    /// Owned storage, non-blocking release.
    pub const fn async_buffer() -> Self {
        Self {
            storage: Storage::Owned,
            writeback: false,
            destructor: Destructor::NonBlocking,
        }
    }

    /// View of caller pointers, blocking release, no writeback.
    pub const fn sync_view() -> Self {
        Self {
            storage: Storage::View,
            writeback: false,
            destructor: Destructor::Blocking,
        }
    }

    /// View of caller pointers, non-blocking release, no writeback.
    pub const fn async_view() -> Self {
        Self {
            storage: Storage::View,
            writeback: false,
            destructor: Destructor::NonBlocking,
        }
    }

    /// View with writeback, blocking release.
    pub const fn sync_writeback_view() -> Self {
        Self {
            storage: Storage::View,
            writeback: true,
            destructor: Destructor::Blocking,
        }
    }

    /// View with writeback, non-blocking release.
    pub const fn async_writeback_view() -> Self {
        Self {
            storage: Storage::View,
            writeback: true,
            destructor: Destructor::NonBlocking,
        }
    }

    /// Reject combinations that are not offered.
    pub fn validate(&self) -> Result<()> {
        if self.storage == Storage::Owned && self.writeback {
            return Err(HetmemError::InvalidPolicy(
                "writeback requires view storage".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BehaviorPolicy {
    fn default() -> Self {
        Self::sync_buffer()
    }
}

/// Shape and element size of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDesc {
    /// Extent per dimension.
    pub shape: Vec<usize>,
    /// Size of one element in bytes.
    pub element_size: usize,
}

impl ArrayDesc {
    /// Describe an array of `T` with the given shape.
    pub fn new<T>(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            element_size: std::mem::size_of::<T>(),
        }
    }

    /// Describe an untyped byte array.
    pub fn bytes(len: usize) -> Self {
        Self {
            shape: vec![len],
            element_size: 1,
        }
    }

    /// Number of elements, `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Total size in bytes.
    pub fn size_bytes(&self) -> Result<usize> {
        self.element_count()
            .and_then(|n| n.checked_mul(self.element_size))
            .ok_or_else(|| {
                HetmemError::InvalidConfig(format!("array shape {:?} overflows", self.shape))
            })
    }
}

/// Initial contents of a new array.
#[derive(Debug, Clone, Default)]
pub enum ArraySeed {
    /// Undefined contents.
    #[default]
    Uninit,
    /// Host data, copied to the first device that reads it.
    Host(Arc<[u8]>),
    /// Pre-existing device allocations.
    Pointers {
        /// One pointer per device.
        pointers: Vec<(DeviceId, DevicePtr)>,
        /// Whether the pointers already hold the array's contents.
        assume_valid: bool,
    },
}

impl ArraySeed {
    /// Seed from a typed host slice.
    pub fn from_slice<T: bytemuck::Pod>(data: &[T]) -> Self {
        ArraySeed::Host(Arc::from(bytemuck::cast_slice::<T, u8>(data)))
    }

    /// Seed from a single caller pointer.
    pub fn pointer(device: DeviceId, ptr: DevicePtr, assume_valid: bool) -> Self {
        ArraySeed::Pointers {
            pointers: vec![(device, ptr)],
            assume_valid,
        }
    }
}

/// Caller-facing handle on a managed array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHandle {
    id: ArrayId,
    desc: Arc<ArrayDesc>,
    size: usize,
    policy: BehaviorPolicy,
}

impl ArrayHandle {
    /// Array id.
    pub fn id(&self) -> ArrayId {
        self.id
    }

    /// Shape and element size.
    pub fn desc(&self) -> &ArrayDesc {
        &self.desc
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// Behavior policy.
    pub fn policy(&self) -> BehaviorPolicy {
        self.policy
    }
}

/// Result of a tracked access request.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    /// Operation performing the access; pending until submitted.
    pub operation: Operation,
    /// Array accessed.
    pub array: ArrayId,
    /// Device the access happens on.
    pub device: DeviceId,
    /// Access mode.
    pub mode: AccessMode,
    /// Pointer to the array's allocation on `device`.
    pub pointer: DevicePtr,
    /// Operations the access is ordered after, ascending by id.
    pub predecessors: Vec<Operation>,
    /// Copy queued to bring `device` up to date, if any.
    pub transfer: Option<Operation>,
}

/// State needed to take back a write that was never submitted.
#[derive(Debug, Clone)]
pub(crate) struct WriteUndo {
    op: Operation,
    validity: ValidityRecord,
    history: AccessHistory,
    transfer: Option<Operation>,
}

/// Effect of one access on the array's bookkeeping.
pub(crate) struct AccessOutcome {
    pub pointer: DevicePtr,
    pub predecessors: Vec<Operation>,
    pub transfer: Option<Operation>,
    pub allocated: Option<usize>,
}

/// Mutable state of a live array.
pub(crate) struct ArrayState {
    pub handle: ArrayHandle,
    pub allocations: AllocationRegistry,
    pub validity: ValidityRecord,
    pub history: AccessHistory,
    pub released: bool,
    undo: HashMap<OperationId, WriteUndo>,
}

impl ArrayState {
    /// Build the state of a new array; nothing is allocated yet.
    pub fn create(
        desc: ArrayDesc,
        policy: BehaviorPolicy,
        seed: ArraySeed,
        devices: &DeviceSet,
    ) -> Result<Self> {
        policy.validate()?;
        let size = desc.size_bytes()?;
        let id = ArrayId::generate();
        let mut allocations = AllocationRegistry::new(id, size);
        let validity = match seed {
            ArraySeed::Uninit => ValidityRecord::new(),
            ArraySeed::Host(data) => {
                if data.len() != size {
                    return Err(HetmemError::SizeMismatch {
                        expected: size,
                        actual: data.len(),
                    });
                }
                ValidityRecord::with_seed(data)
            }
            ArraySeed::Pointers {
                pointers,
                assume_valid,
            } => {
                let mut validity = ValidityRecord::new();
                for (device, ptr) in pointers {
                    devices.check(device)?;
                    allocations.embed(device, ptr)?;
                    if assume_valid {
                        validity.mark_current(device);
                    } else {
                        validity.track(device);
                    }
                }
                validity
            }
        };
        if policy.storage == Storage::View && allocations.is_empty() {
            return Err(HetmemError::InvalidPolicy(
                "view storage requires at least one caller pointer".to_string(),
            ));
        }
        Ok(Self {
            handle: ArrayHandle {
                id,
                desc: Arc::new(desc),
                size,
                policy,
            },
            allocations,
            validity,
            history: AccessHistory::new(),
            released: false,
            undo: HashMap::new(),
        })
    }

    pub fn id(&self) -> ArrayId {
        self.handle.id
    }

    /// Record an access by `op`.
    ///
    /// Every fallible step (device lookup, allocation, cycle check) runs
    /// before the first mutation, so a failed request leaves the array as
    /// it was.
    pub fn access(
        &mut self,
        op: &Operation,
        device: DeviceId,
        mode: AccessMode,
        devices: &DeviceSet,
        config: &RuntimeConfig,
    ) -> Result<AccessOutcome> {
        let array = self.id();
        self.prune_undo();
        if op.accesses_array(array) {
            return Err(HetmemError::DuplicateAccess { op: op.id(), array });
        }
        devices.check(device)?;

        let resolution = self
            .validity
            .resolve(device, mode, devices, self.allocations.size());
        let source_ptr = match &resolution.source {
            Some(MigrationSource::Device(src)) => Some(
                self.allocations
                    .get(*src)
                    .ok_or(HetmemError::NoAllocation { array, device: *src })?,
            ),
            _ => None,
        };
        let src_device = match &resolution.source {
            Some(MigrationSource::Device(src)) => Some(*src),
            _ => None,
        };

        let mut ordered_after = self.history.compute_dependencies(device, mode, op.id());
        if resolution.needs_migration {
            ordered_after.extend(self.history.transfer_dependencies(src_device, device));
        }
        for pred in &ordered_after {
            if op.would_cycle(pred) {
                return Err(HetmemError::DependencyCycle {
                    op: op.id(),
                    predecessor: pred.id(),
                });
            }
        }

        let (pointer, created) = self.allocations.materialize(device, devices, config)?;

        let saved = mode.writes().then(|| (self.validity.clone(), self.history.clone()));

        let transfer = match resolution.source {
            Some(source) => Some(self.queue_transfer(
                OperationKind::Migration,
                source,
                source_ptr,
                device,
                pointer,
            )?),
            None => None,
        };

        let predecessors = self.history.compute_dependencies(device, mode, op.id());
        for pred in &predecessors {
            op.add_predecessor(pred)?;
        }
        self.validity.record_access(device, mode);
        self.history.record(op, mode);
        op.add_access(AccessDescriptor {
            device,
            path: AccessPath::Tracked { array, mode },
        });
        if let Some((validity, history)) = saved {
            self.undo.insert(
                op.id(),
                WriteUndo {
                    op: op.clone(),
                    validity,
                    history,
                    transfer: transfer.clone(),
                },
            );
        }

        Ok(AccessOutcome {
            pointer,
            predecessors,
            transfer,
            allocated: created.then_some(self.allocations.size()),
        })
    }

    /// Queue a copy of the array's current contents into `target`.
    fn queue_transfer(
        &mut self,
        kind: OperationKind,
        source: MigrationSource,
        source_ptr: Option<DevicePtr>,
        target: DeviceId,
        dst: DevicePtr,
    ) -> Result<Operation> {
        let bytes = self.allocations.size();
        let (src_device, work) = match (source, source_ptr) {
            (MigrationSource::Device(src_device), Some(src)) => (
                Some(src_device),
                Work::Copy(CopyRequest {
                    src_device,
                    src,
                    dst_device: target,
                    dst,
                    bytes,
                }),
            ),
            (MigrationSource::Device(src_device), None) => {
                return Err(HetmemError::NoAllocation {
                    array: self.id(),
                    device: src_device,
                })
            }
            (MigrationSource::Seed(data), _) => (
                None,
                Work::Upload(UploadRequest {
                    data,
                    dst_device: target,
                    dst,
                }),
            ),
        };
        let kind = match (&work, kind) {
            (Work::Upload(_), OperationKind::Migration) => OperationKind::Upload,
            _ => kind,
        };
        let transfer = Operation::internal(kind, target, work);
        for pred in self.history.transfer_dependencies(src_device, target) {
            transfer.add_predecessor(&pred)?;
        }
        transfer.add_access(AccessDescriptor {
            device: target,
            path: AccessPath::Tracked {
                array: self.id(),
                mode: AccessMode::Write,
            },
        });
        self.history.record_transfer(&transfer, target);
        debug!(
            array = %self.id(),
            op = %transfer.id(),
            ?kind,
            from = ?src_device,
            to = %target,
            bytes,
            "transfer queued"
        );
        Ok(transfer)
    }

    /// Queue writebacks into every stale external allocation.
    pub fn queue_writebacks(&mut self, devices: &DeviceSet) -> Result<Vec<Operation>> {
        let mut writebacks = Vec::new();
        for target in self.allocations.external_devices() {
            let resolution =
                self.validity
                    .resolve(target, AccessMode::Read, devices, self.allocations.size());
            let Some(source) = resolution.source else {
                continue;
            };
            let source_ptr = match &source {
                MigrationSource::Device(src) => self.allocations.get(*src),
                MigrationSource::Seed(_) => None,
            };
            let dst = self
                .allocations
                .get(target)
                .ok_or(HetmemError::NoAllocation {
                    array: self.id(),
                    device: target,
                })?;
            let op = self.queue_transfer(OperationKind::Writeback, source, source_ptr, target, dst)?;
            self.validity.mark_current(target);
            writebacks.push(op);
        }
        Ok(writebacks)
    }

    /// Register a caller pointer after construction.
    pub fn embed(&mut self, device: DeviceId, ptr: DevicePtr, assume_valid: bool) -> Result<()> {
        self.allocations.embed(device, ptr)?;
        if assume_valid {
            self.validity.mark_current(device);
        } else {
            self.validity.track(device);
        }
        // Saved validity no longer describes the array's devices.
        self.undo.clear();
        Ok(())
    }

    /// Take back the effect of a discarded operation.
    pub fn forget(&mut self, op: OperationId) {
        match self.undo.remove(&op) {
            Some(undo) => {
                self.validity = undo.validity;
                self.history = undo.history;
                if let Some(transfer) = undo.transfer {
                    // A copy that can no longer be dropped still writes its
                    // target and must stay ordered and outlived.
                    if let Err(err) = transfer.discard() {
                        debug!(op = %transfer.id(), %err, "transfer kept after discard");
                        self.history.record_transfer(&transfer, transfer.device());
                    }
                }
            }
            None => self.history.remove(op),
        }
    }

    /// Drop undo records of operations that can no longer be discarded.
    pub fn prune_undo(&mut self) {
        self.undo
            .retain(|_, u| u.op.state() == OperationState::Pending && !u.op.is_discarded());
    }
}
