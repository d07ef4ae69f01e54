//! The memory runtime.
//!
//! [`MemoryRuntime`] owns the device set, the execution backend and every
//! live managed array. Each array sits behind its own mutex inside a
//! read-mostly map, so requests on different arrays never contend.
//!
//! # Example
//!
//! ```ignore
//! let runtime = MemoryRuntime::new(devices, backend)?;
//! let array = runtime.create_array(
//!     ArrayDesc::new::<f32>([1024]),
//!     BehaviorPolicy::sync_buffer(),
//!     ArraySeed::Uninit,
//! )?;
//!
//! let grant = runtime.request_access(&array, gpu, AccessMode::Write)?;
//! runtime.submit(&grant.operation, Work::kernel(move || fill(grant.pointer)))?;
//! runtime.wait(&grant.operation).await?;
//! runtime.release(array).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::allocation::{AllocationInfo, AllocationRegistry};
use crate::array::{
    AccessGrant, ArrayDesc, ArrayHandle, ArrayId, ArraySeed, ArrayState, BehaviorPolicy, Destructor,
};
use crate::backend::{EventHandle, ExecutionBackend, Work};
use crate::config::RuntimeConfig;
use crate::device::{DeviceId, DeviceSet};
use crate::error::{HetmemError, Result};
use crate::memory::DevicePtr;
use crate::operation::{
    AccessDescriptor, AccessMode, AccessPath, Operation, OperationId, OperationKind,
    OperationState,
};
use crate::stats::{RuntimeStats, RuntimeStatsSnapshot};

/// Storage of a released array, kept until its operations finish.
struct RetiredArray {
    id: ArrayId,
    allocations: AllocationRegistry,
    outstanding: Vec<Operation>,
}

impl RetiredArray {
    fn is_idle(&self) -> bool {
        self.outstanding.iter().all(Operation::is_complete)
    }
}

/// Wait for `op`, submitting it first if it is an internal operation.
async fn wait_operation(op: &Operation, backend: &dyn ExecutionBackend) -> Result<()> {
    let event = match op.state() {
        OperationState::Pending if op.kind().is_internal() => {
            op.submitted_event(op.id(), backend)?
        }
        OperationState::Pending => return Err(HetmemError::NotSubmitted(op.id())),
        _ => op.event().ok_or(HetmemError::NotSubmitted(op.id()))?,
    };
    backend.wait(&event).await
}

/// Pending outcome of [`MemoryRuntime::release`].
pub struct ReleaseHandle {
    array: ArrayId,
    writebacks: Vec<Operation>,
    outstanding: Vec<Operation>,
    backend: Arc<dyn ExecutionBackend>,
}

impl ReleaseHandle {
    /// Released array.
    pub fn array(&self) -> ArrayId {
        self.array
    }

    /// Writeback copies queued by the release.
    pub fn writebacks(&self) -> &[Operation] {
        &self.writebacks
    }

    /// Operations the array's storage must outlive, writebacks included.
    pub fn outstanding(&self) -> &[Operation] {
        &self.outstanding
    }

    /// Check if every outstanding operation has finished.
    pub fn is_complete(&self) -> bool {
        self.outstanding.iter().all(Operation::is_complete)
    }

    /// Wait for the writebacks and every outstanding operation.
    pub async fn wait(&self) -> Result<()> {
        for op in &self.outstanding {
            wait_operation(op, self.backend.as_ref()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("array", &self.array)
            .field("writebacks", &self.writebacks)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

/// Builder for a [`MemoryRuntime`].
pub struct MemoryRuntimeBuilder {
    devices: DeviceSet,
    backend: Arc<dyn ExecutionBackend>,
    config: RuntimeConfig,
}

impl MemoryRuntimeBuilder {
    /// Use the given configuration.
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<MemoryRuntime> {
        self.config.validate()?;
        info!(
            "Initializing memory runtime ({} devices, backend={})",
            self.devices.len(),
            self.backend.name()
        );
        Ok(MemoryRuntime {
            devices: self.devices,
            backend: self.backend,
            config: self.config,
            arrays: RwLock::new(HashMap::new()),
            internal: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            stats: RuntimeStats::new(),
            shutdown: RwLock::new(false),
        })
    }
}

/// Memory-management core of a heterogeneous runtime.
pub struct MemoryRuntime {
    devices: DeviceSet,
    backend: Arc<dyn ExecutionBackend>,
    config: RuntimeConfig,
    arrays: RwLock<HashMap<ArrayId, Arc<Mutex<ArrayState>>>>,
    /// Internal operations not yet handed to the backend.
    internal: Mutex<Vec<Operation>>,
    retired: Mutex<Vec<RetiredArray>>,
    stats: RuntimeStats,
    shutdown: RwLock<bool>,
}

impl MemoryRuntime {
    /// Create a runtime with the default configuration.
    pub fn new(devices: DeviceSet, backend: Arc<dyn ExecutionBackend>) -> Result<Self> {
        Self::builder(devices, backend).build()
    }

    /// Create a builder.
    pub fn builder(devices: DeviceSet, backend: Arc<dyn ExecutionBackend>) -> MemoryRuntimeBuilder {
        MemoryRuntimeBuilder {
            devices,
            backend,
            config: RuntimeConfig::default(),
        }
    }

    /// Devices managed by the runtime.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Execution backend.
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Live counters.
    pub fn stats(&self) -> RuntimeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of live (unreleased) arrays.
    pub fn array_count(&self) -> usize {
        self.arrays.read().len()
    }

    /// Number of released arrays whose storage is still held.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Check if the runtime has been shut down.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.read()
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(HetmemError::BackendError(
                "memory runtime has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn with_array<R>(
        &self,
        array: &ArrayHandle,
        f: impl FnOnce(&mut ArrayState) -> Result<R>,
    ) -> Result<R> {
        let state = self
            .arrays
            .read()
            .get(&array.id())
            .cloned()
            .ok_or(HetmemError::ArrayReleased(array.id()))?;
        let mut state = state.lock();
        if state.released {
            return Err(HetmemError::ArrayReleased(array.id()));
        }
        f(&mut state)
    }

    // ===== Arrays =====

    /// Create a managed array.
    pub fn create_array(
        &self,
        desc: ArrayDesc,
        policy: BehaviorPolicy,
        seed: ArraySeed,
    ) -> Result<ArrayHandle> {
        self.check_running()?;
        let state = ArrayState::create(desc, policy, seed, &self.devices)?;
        let handle = state.handle.clone();
        debug!(
            array = %handle.id(),
            bytes = handle.size_bytes(),
            ?policy,
            "array created"
        );
        self.arrays
            .write()
            .insert(handle.id(), Arc::new(Mutex::new(state)));
        self.stats.track_array_created();
        Ok(handle)
    }

    /// Request access to `array` on `device` for a new operation.
    ///
    /// The returned operation is pending; hand it its work with
    /// [`MemoryRuntime::submit`].
    pub fn request_access(
        &self,
        array: &ArrayHandle,
        device: DeviceId,
        mode: AccessMode,
    ) -> Result<AccessGrant> {
        self.check_running()?;
        self.devices.check(device)?;
        let op = Operation::new(OperationKind::Kernel, device);
        self.record_access(&op, array, device, mode)
    }

    /// Add an access to another array to a pending operation.
    ///
    /// The access happens on the operation's device.
    pub fn request_access_in(
        &self,
        op: &Operation,
        array: &ArrayHandle,
        mode: AccessMode,
    ) -> Result<AccessGrant> {
        self.check_running()?;
        op.ensure_pending(OperationState::Pending)?;
        self.record_access(op, array, op.device(), mode)
    }

    fn record_access(
        &self,
        op: &Operation,
        array: &ArrayHandle,
        device: DeviceId,
        mode: AccessMode,
    ) -> Result<AccessGrant> {
        if self.config.collect_on_request {
            self.try_collect_garbage();
        }
        let outcome = self.with_array(array, |state| {
            state.access(op, device, mode, &self.devices, &self.config)
        })?;
        if let Some(bytes) = outcome.allocated {
            self.stats.track_alloc(bytes);
        }
        if let Some(transfer) = &outcome.transfer {
            match transfer.kind() {
                OperationKind::Upload => self.stats.track_upload(),
                _ => self.stats.track_migration(),
            }
            self.enqueue_internal([transfer.clone()]);
        }
        trace!(
            op = %op.id(),
            array = %array.id(),
            %device,
            ?mode,
            predecessors = outcome.predecessors.len(),
            "access recorded"
        );
        Ok(AccessGrant {
            operation: op.clone(),
            array: array.id(),
            device,
            mode,
            pointer: outcome.pointer,
            predecessors: outcome.predecessors,
            transfer: outcome.transfer,
        })
    }

    /// Pointer of `array` on `device`, or `None` if nothing is allocated there.
    pub fn extract_pointer(&self, array: &ArrayHandle, device: DeviceId) -> Result<Option<DevicePtr>> {
        self.devices.check(device)?;
        self.with_array(array, |state| Ok(state.allocations.get(device)))
    }

    /// Register a caller-supplied allocation of `array` on `device`.
    ///
    /// If `assume_valid` is set the pointer is taken to hold the array's
    /// current contents; otherwise it is treated as empty.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`ArrayHandle::size_bytes`] bytes of
    /// memory usable on `device`, and must stay valid until the array's
    /// storage has been reclaimed after release.
    pub unsafe fn embed_pointer(
        &self,
        array: &ArrayHandle,
        device: DeviceId,
        ptr: DevicePtr,
        assume_valid: bool,
    ) -> Result<()> {
        self.devices.check(device)?;
        self.with_array(array, |state| state.embed(device, ptr, assume_valid))?;
        debug!(array = %array.id(), %device, ptr = %ptr, assume_valid, "pointer embedded");
        Ok(())
    }

    /// Stop owning the allocation of `array` on `device`.
    ///
    /// The memory is no longer freed by the runtime. No-op if the
    /// allocation is already external or does not exist.
    pub fn disown(&self, array: &ArrayHandle, device: DeviceId) -> Result<()> {
        self.devices.check(device)?;
        let bytes = self.with_array(array, |state| Ok(state.allocations.disown(device)))?;
        if bytes > 0 {
            self.stats.track_release_bytes(bytes);
        }
        Ok(())
    }

    /// Bring `device` up to date (or claim it as written) without a kernel.
    ///
    /// Returns the update operation so callers can wait for it.
    pub fn force_update(
        &self,
        array: &ArrayHandle,
        device: DeviceId,
        mode: AccessMode,
    ) -> Result<Operation> {
        self.check_running()?;
        self.devices.check(device)?;
        let op = Operation::internal(OperationKind::Update, device, Work::Barrier);
        self.record_access(&op, array, device, mode)?;
        self.enqueue_internal([op.clone()]);
        Ok(op)
    }

    /// Per-device current flags of every allocation of `array`.
    pub fn validity(&self, array: &ArrayHandle) -> Result<BTreeMap<DeviceId, bool>> {
        self.with_array(array, |state| {
            Ok(state
                .allocations
                .infos()
                .into_iter()
                .map(|info| (info.device, state.validity.is_current(info.device)))
                .collect())
        })
    }

    /// Allocations of `array`, in device order.
    pub fn allocations(&self, array: &ArrayHandle) -> Result<Vec<AllocationInfo>> {
        self.with_array(array, |state| Ok(state.allocations.infos()))
    }

    /// Release `array`.
    ///
    /// With writeback enabled, stale caller allocations receive a copy of
    /// the current contents. A blocking policy waits for those copies and
    /// for every outstanding operation; a non-blocking one returns at once
    /// and leaves reclamation to [`MemoryRuntime::collect_garbage`].
    pub async fn release(&self, array: ArrayHandle) -> Result<ReleaseHandle> {
        let id = array.id();
        let policy = array.policy();
        let (writebacks, retired) = {
            let mut arrays = self.arrays.write();
            let entry = arrays
                .get(&id)
                .cloned()
                .ok_or(HetmemError::ArrayReleased(id))?;
            let mut state = entry.lock();
            if state.released {
                return Err(HetmemError::ArrayReleased(id));
            }
            if policy.destructor == Destructor::Blocking {
                let unsubmitted = state.history.outstanding().into_iter().find(|op| {
                    !op.kind().is_internal() && op.state() == OperationState::Pending
                });
                if let Some(op) = unsubmitted {
                    return Err(HetmemError::NotSubmitted(op.id()));
                }
            }
            let writebacks = if policy.writeback {
                state.queue_writebacks(&self.devices)?
            } else {
                Vec::new()
            };
            state.released = true;
            arrays.remove(&id);
            let size = state.allocations.size();
            let allocations =
                std::mem::replace(&mut state.allocations, AllocationRegistry::new(id, size));
            let retired = RetiredArray {
                id,
                allocations,
                outstanding: state.history.outstanding(),
            };
            (writebacks, retired)
        };

        self.stats.track_array_released();
        self.stats.track_writebacks(writebacks.len());
        debug!(
            array = %id,
            writebacks = writebacks.len(),
            outstanding = retired.outstanding.len(),
            ?policy,
            "array released"
        );

        let handle = ReleaseHandle {
            array: id,
            writebacks: writebacks.clone(),
            outstanding: retired.outstanding.clone(),
            backend: Arc::clone(&self.backend),
        };
        self.retired.lock().push(retired);
        self.enqueue_internal(writebacks);

        if policy.destructor == Destructor::Blocking {
            handle.wait().await?;
            self.collect_garbage();
        }
        Ok(handle)
    }

    // ===== Operations =====

    /// Hand caller work for a pending operation to the backend.
    ///
    /// Every predecessor must already be submitted; pending internal
    /// predecessors are submitted on the way.
    pub fn submit(&self, op: &Operation, work: Work) -> Result<EventHandle> {
        if op.kind() != OperationKind::Kernel {
            return Err(HetmemError::InvalidStateTransition {
                op: op.id(),
                from: op.state(),
                to: OperationState::Submitted,
            });
        }
        let event = op.submit(self.backend.as_ref(), work)?;
        self.stats.track_submitted();
        if self.config.eager_submission {
            self.pump();
        }
        Ok(event)
    }

    /// Submit work on raw pointers, ordered only after `depends_on`.
    ///
    /// The work is invisible to array tracking: if it writes an array's
    /// memory, follow it with [`MemoryRuntime::force_update`].
    pub fn submit_untracked(
        &self,
        device: DeviceId,
        pointers: Vec<DevicePtr>,
        depends_on: &[Operation],
        work: Work,
    ) -> Result<Operation> {
        self.check_running()?;
        self.devices.check(device)?;
        let op = Operation::new(OperationKind::Untracked, device);
        if let Some(pred) = depends_on
            .iter()
            .find(|p| !p.kind().is_internal() && p.state() == OperationState::Pending)
        {
            return Err(HetmemError::PredecessorNotSubmitted {
                op: op.id(),
                predecessor: pred.id(),
            });
        }
        op.add_access(AccessDescriptor {
            device,
            path: AccessPath::Untracked { pointers },
        });
        for pred in depends_on {
            op.add_predecessor(pred)?;
        }
        op.submit(self.backend.as_ref(), work)?;
        self.stats.track_submitted();
        if self.config.eager_submission {
            self.pump();
        }
        Ok(op)
    }

    /// Order `op` after `predecessor`.
    pub fn add_dependency(&self, op: &Operation, predecessor: &Operation) -> Result<()> {
        op.add_predecessor(predecessor)
    }

    /// Drop a pending operation nobody depends on.
    ///
    /// Its accesses are removed from the arrays' histories; a discarded
    /// write restores the validity state from before the write.
    pub fn discard(&self, op: &Operation) -> Result<()> {
        if op.kind() != OperationKind::Kernel {
            return Err(HetmemError::DiscardRejected {
                op: op.id(),
                reason: format!("{:?} operations are managed by the runtime", op.kind()),
            });
        }
        let mut ids: Vec<ArrayId> = op
            .accesses()
            .iter()
            .filter_map(AccessDescriptor::array)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        let states: Vec<Arc<Mutex<ArrayState>>> = {
            let arrays = self.arrays.read();
            ids.iter().filter_map(|id| arrays.get(id).cloned()).collect()
        };
        // Locked in id order.
        let mut guards: Vec<_> = states.iter().map(|s| s.lock()).collect();
        op.discard()?;
        for state in guards.iter_mut() {
            state.forget(op.id());
        }
        drop(guards);
        self.stats.track_discarded();
        Ok(())
    }

    /// Wait for an operation to finish.
    ///
    /// Internal operations are submitted first; waiting on a caller
    /// operation that was never submitted fails with `NotSubmitted`.
    pub async fn wait(&self, op: &Operation) -> Result<()> {
        if op.is_discarded() {
            return Err(HetmemError::NotSubmitted(op.id()));
        }
        self.pump();
        let result = wait_operation(op, self.backend.as_ref()).await;
        if self.config.collect_on_request {
            self.try_collect_garbage();
        }
        result
    }

    fn enqueue_internal(&self, ops: impl IntoIterator<Item = Operation>) {
        self.internal.lock().extend(ops);
        if self.config.eager_submission {
            self.pump();
        }
    }

    /// Submit internal operations whose predecessors have all been submitted.
    fn pump(&self) {
        let mut internal = self.internal.lock();
        loop {
            let before = internal.len();
            internal.retain(|op| match op.try_submit(self.backend.as_ref()) {
                Ok(submitted) => !submitted,
                Err(e) => {
                    warn!(op = %op.id(), kind = ?op.kind(), "internal submission failed: {}", e);
                    false
                }
            });
            if internal.len() == before {
                break;
            }
        }
    }

    // ===== Reclamation =====

    /// Free the storage of released arrays whose operations have finished.
    ///
    /// Returns the number of arrays reclaimed.
    pub fn collect_garbage(&self) -> usize {
        let mut retired = self.retired.lock();
        self.collect_locked(&mut retired)
    }

    fn try_collect_garbage(&self) {
        if let Some(mut retired) = self.retired.try_lock() {
            self.collect_locked(&mut retired);
        }
    }

    fn collect_locked(&self, retired: &mut Vec<RetiredArray>) -> usize {
        let (idle, busy): (Vec<_>, Vec<_>) = retired.drain(..).partition(RetiredArray::is_idle);
        *retired = busy;
        for array in &idle {
            let owned = array.allocations.owned_count();
            self.stats
                .track_free(owned, array.allocations.owned_bytes());
            self.stats.track_array_collected();
            debug!(array = %array.id, freed = owned, "released array reclaimed");
        }
        idle.len()
    }

    /// Wait for all submitted and internal work, then reclaim released arrays.
    ///
    /// Caller operations that were never submitted are skipped. Further
    /// requests fail once this has been called.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut shutdown = self.shutdown.write();
            if *shutdown {
                return Ok(());
            }
            *shutdown = true;
        }
        info!("Shutting down memory runtime");
        self.pump();

        let mut ops: Vec<Operation> = self.internal.lock().clone();
        let states: Vec<_> = self.arrays.read().values().cloned().collect();
        for state in states {
            ops.extend(state.lock().history.outstanding());
        }
        for array in self.retired.lock().iter() {
            ops.extend(array.outstanding.iter().cloned());
        }
        ops.sort_by_key(Operation::id);
        ops.dedup_by_key(|op| op.id());

        let mut first_error = None;
        for op in &ops {
            if !op.kind().is_internal() && op.state() == OperationState::Pending {
                warn!(op = %op.id(), "skipping operation that was never submitted");
                continue;
            }
            if let Err(e) = wait_operation(op, self.backend.as_ref()).await {
                warn!(op = %op.id(), "operation failed during shutdown: {}", e);
                first_error.get_or_insert(e);
            }
        }
        let reclaimed = self.collect_garbage();
        info!(
            "Memory runtime shut down ({} operations drained, {} arrays reclaimed)",
            ops.len(),
            reclaimed
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ids of operations still holding `array`'s storage.
    pub fn outstanding(&self, array: &ArrayHandle) -> Result<Vec<OperationId>> {
        self.with_array(array, |state| {
            Ok(state
                .history
                .outstanding()
                .iter()
                .map(Operation::id)
                .collect())
        })
    }
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("devices", &self.devices)
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("arrays", &self.array_count())
            .finish()
    }
}
