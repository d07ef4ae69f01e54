//! Error types for hetmem.

use thiserror::Error;

use crate::array::ArrayId;
use crate::device::DeviceId;
use crate::operation::{OperationId, OperationState};

/// Result type alias for hetmem operations.
pub type Result<T> = std::result::Result<T, HetmemError>;

/// Comprehensive error type for hetmem operations.
#[derive(Error, Debug)]
pub enum HetmemError {
    // ===== Allocation Errors =====
    /// Device memory could not be obtained.
    ///
    /// Fatal to the requesting operation only; allocations on other devices
    /// and the array's validity state are left untouched.
    #[error("allocation of {size} bytes failed on {device}: {reason}")]
    AllocationFailure {
        /// Device the allocation was attempted on.
        device: DeviceId,
        /// Requested size in bytes.
        size: usize,
        /// Reason reported by the allocator.
        reason: String,
    },

    /// An allocation already exists for this (array, device) pair.
    #[error("{array} already holds an allocation on {device}")]
    AllocationConflict {
        /// Array the pointer was embedded into.
        array: ArrayId,
        /// Device that already holds an allocation.
        device: DeviceId,
    },

    /// No allocation has been materialized for this (array, device) pair.
    #[error("{array} has no allocation on {device}")]
    NoAllocation {
        /// Array that was queried.
        array: ArrayId,
        /// Device that was queried.
        device: DeviceId,
    },

    /// A null pointer was supplied where a device allocation is required.
    #[error("null pointer supplied for {array} on {device}")]
    NullPointer {
        /// Array the pointer was meant for.
        array: ArrayId,
        /// Device the pointer was meant for.
        device: DeviceId,
    },

    /// Seed data does not match the array's byte size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Expected size in bytes.
        expected: usize,
        /// Supplied size in bytes.
        actual: usize,
    },

    // ===== Handle Errors =====
    /// Device is not part of the runtime's device set.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// Array has been released.
    #[error("{0} has been released")]
    ArrayReleased(ArrayId),

    /// Behavior policy combination is not offered.
    #[error("invalid behavior policy: {0}")]
    InvalidPolicy(String),

    // ===== Operation Errors =====
    /// Invalid operation state transition.
    #[error("invalid state transition for {op}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// Operation being transitioned.
        op: OperationId,
        /// Current state.
        from: OperationState,
        /// Requested state.
        to: OperationState,
    },

    /// A predecessor has not been submitted yet.
    #[error("{op} depends on {predecessor}, which has not been submitted")]
    PredecessorNotSubmitted {
        /// Operation being submitted.
        op: OperationId,
        /// Predecessor still pending.
        predecessor: OperationId,
    },

    /// Operation has not been submitted and cannot be waited on.
    #[error("{0} has not been submitted")]
    NotSubmitted(OperationId),

    /// An operation may access a given array at most once.
    #[error("{op} already accesses {array}")]
    DuplicateAccess {
        /// Operation requesting the access.
        op: OperationId,
        /// Array accessed twice.
        array: ArrayId,
    },

    /// Adding a dependency edge would close a cycle.
    #[error("dependency {op} -> {predecessor} would create a cycle")]
    DependencyCycle {
        /// Dependent operation.
        op: OperationId,
        /// Proposed predecessor.
        predecessor: OperationId,
    },

    /// Operation cannot be discarded.
    #[error("cannot discard {op}: {reason}")]
    DiscardRejected {
        /// Operation that was to be discarded.
        op: OperationId,
        /// Why the discard was refused.
        reason: String,
    },

    // ===== Execution Errors =====
    /// A data transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Caller-supplied kernel work failed.
    #[error("kernel failed: {0}")]
    KernelFailed(String),

    /// Generic backend error.
    #[error("backend error: {0}")]
    BackendError(String),

    // ===== Configuration Errors =====
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl HetmemError {
    /// Returns true if the error is caused by the caller rather than the device.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            HetmemError::AllocationConflict { .. }
                | HetmemError::UnknownDevice(_)
                | HetmemError::ArrayReleased(_)
                | HetmemError::InvalidPolicy(_)
                | HetmemError::InvalidStateTransition { .. }
                | HetmemError::PredecessorNotSubmitted { .. }
                | HetmemError::DependencyCycle { .. }
                | HetmemError::DiscardRejected { .. }
                | HetmemError::NullPointer { .. }
                | HetmemError::SizeMismatch { .. }
                | HetmemError::NotSubmitted(_)
                | HetmemError::DuplicateAccess { .. }
        )
    }
}
