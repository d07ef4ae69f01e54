//! Dependency graph builder.
//!
//! Tracks, per managed array, the in-flight accesses that later accesses
//! must order after. Conflicts are whole-array: two accesses conflict when
//! at least one of them writes. The history keeps the transitive reduction
//! of the conflict set:
//!
//! - the last writer (every earlier writer is its ancestor),
//! - the readers recorded since that writer (a new writer must wait on all
//!   of them, a new reader on none),
//! - per device, the last transfer that filled that device's allocation
//!   (any access on the device waits on it).
//!
//! Completed operations are pruned before every computation.

use std::collections::BTreeMap;

use crate::device::DeviceId;
use crate::operation::{AccessMode, Operation, OperationId};

/// In-flight access history of one managed array.
#[derive(Debug, Clone, Default)]
pub struct AccessHistory {
    last_writer: Option<Operation>,
    readers: Vec<Operation>,
    incoming: BTreeMap<DeviceId, Operation>,
}

impl AccessHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop completed operations.
    pub fn prune_completed(&mut self) {
        if self.last_writer.as_ref().is_some_and(Operation::is_complete) {
            self.last_writer = None;
        }
        self.readers.retain(|op| !op.is_complete());
        self.incoming.retain(|_, op| !op.is_complete());
    }

    /// Prior operations an access of `mode` on `device` must wait for.
    ///
    /// `exclude` is the requesting operation itself.
    pub fn compute_dependencies(
        &mut self,
        device: DeviceId,
        mode: AccessMode,
        exclude: OperationId,
    ) -> Vec<Operation> {
        self.prune_completed();
        let mut deps: Vec<Operation> = Vec::new();
        if let Some(writer) = &self.last_writer {
            deps.push(writer.clone());
        }
        if mode.writes() {
            deps.extend(self.readers.iter().cloned());
        }
        if let Some(transfer) = self.incoming.get(&device) {
            deps.push(transfer.clone());
        }
        Self::finish(deps, exclude)
    }

    /// Prior operations a transfer from `source` into `target` must wait for.
    pub fn transfer_dependencies(
        &mut self,
        source: Option<DeviceId>,
        target: DeviceId,
    ) -> Vec<Operation> {
        self.prune_completed();
        let mut deps: Vec<Operation> = Vec::new();
        if let Some(writer) = &self.last_writer {
            deps.push(writer.clone());
        }
        if let Some(transfer) = source.and_then(|s| self.incoming.get(&s)) {
            deps.push(transfer.clone());
        }
        if let Some(transfer) = self.incoming.get(&target) {
            deps.push(transfer.clone());
        }
        Self::finish(deps, OperationId::new(0))
    }

    fn finish(mut deps: Vec<Operation>, exclude: OperationId) -> Vec<Operation> {
        deps.retain(|op| op.id() != exclude);
        deps.sort_by_key(Operation::id);
        deps.dedup_by_key(|op| op.id());
        deps
    }

    /// Record `op` as the newest access of `mode`.
    pub fn record(&mut self, op: &Operation, mode: AccessMode) {
        if mode.writes() {
            self.last_writer = Some(op.clone());
            self.readers.clear();
            self.incoming.clear();
        } else if !self.readers.iter().any(|r| r.id() == op.id()) {
            self.readers.push(op.clone());
        }
    }

    /// Record a transfer that fills `target`'s allocation.
    ///
    /// Transfers never change the logical contents, so they count as readers.
    pub fn record_transfer(&mut self, op: &Operation, target: DeviceId) {
        self.record(op, AccessMode::Read);
        self.incoming.insert(target, op.clone());
    }

    /// Remove every trace of `op`.
    pub fn remove(&mut self, op: OperationId) {
        if self.last_writer.as_ref().is_some_and(|w| w.id() == op) {
            self.last_writer = None;
        }
        self.readers.retain(|r| r.id() != op);
        self.incoming.retain(|_, t| t.id() != op);
    }

    /// Last recorded writer, if still in flight.
    pub fn last_writer(&self) -> Option<&Operation> {
        self.last_writer.as_ref()
    }

    /// Readers recorded since the last writer.
    pub fn readers(&self) -> &[Operation] {
        &self.readers
    }

    /// Every in-flight operation the array's storage must outlive.
    pub fn outstanding(&mut self) -> Vec<Operation> {
        self.prune_completed();
        let mut ops: Vec<Operation> = self.last_writer.iter().cloned().collect();
        ops.extend(self.readers.iter().cloned());
        ops.extend(self.incoming.values().cloned());
        Self::finish(ops, OperationId::new(0))
    }

    /// Check if no operation is in flight.
    pub fn is_quiescent(&mut self) -> bool {
        self.outstanding().is_empty()
    }
}
