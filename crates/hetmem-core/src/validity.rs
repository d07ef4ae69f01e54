//! Validity tracking.
//!
//! A [`ValidityRecord`] remembers, for every device holding an allocation of
//! an array, whether that allocation holds the latest written contents. It
//! decides when an access needs a migration and where the data comes from.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::{DeviceId, DeviceSet};
use crate::operation::AccessMode;

/// Where a migration copies current data from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    /// Another device's current allocation.
    Device(DeviceId),
    /// Host data supplied at construction and not yet uploaded anywhere.
    Seed(Arc<[u8]>),
}

/// Outcome of [`ValidityRecord::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Whether the target must receive a copy before the access.
    pub needs_migration: bool,
    /// Source of the copy, when one is needed.
    pub source: Option<MigrationSource>,
}

impl Resolution {
    fn none() -> Self {
        Self {
            needs_migration: false,
            source: None,
        }
    }

    fn from(source: MigrationSource) -> Self {
        Self {
            needs_migration: true,
            source: Some(source),
        }
    }
}

/// Per-device "current" flags of one array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidityRecord {
    current: BTreeMap<DeviceId, bool>,
    seed: Option<Arc<[u8]>>,
}

impl ValidityRecord {
    /// Create a record with no device entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record whose initial contents are host data.
    pub fn with_seed(seed: Arc<[u8]>) -> Self {
        Self {
            current: BTreeMap::new(),
            seed: Some(seed),
        }
    }

    /// Add an entry for `device`, leaving an existing flag untouched.
    pub fn track(&mut self, device: DeviceId) {
        self.current.entry(device).or_insert(false);
    }

    /// Mark `device` current without affecting other devices.
    pub fn mark_current(&mut self, device: DeviceId) {
        self.current.insert(device, true);
        self.seed = None;
    }

    /// Check if `device` holds current data.
    pub fn is_current(&self, device: DeviceId) -> bool {
        self.current.get(&device).copied().unwrap_or(false)
    }

    /// Devices holding current data, in registration order.
    pub fn current_devices(&self) -> Vec<DeviceId> {
        self.current
            .iter()
            .filter(|(_, &current)| current)
            .map(|(&d, _)| d)
            .collect()
    }

    /// Host seed still waiting to be uploaded.
    pub fn seed(&self) -> Option<&Arc<[u8]>> {
        self.seed.as_ref()
    }

    /// Decide whether an access of `mode` on `device` needs a migration.
    ///
    /// Candidate sources are ranked by the device set's cost model, then by
    /// registration order. The host seed is only used when no device is
    /// current. With nothing current anywhere the contents are undefined and
    /// no copy is needed.
    pub fn resolve(
        &self,
        device: DeviceId,
        mode: AccessMode,
        devices: &DeviceSet,
        bytes: usize,
    ) -> Resolution {
        if !mode.reads() || self.is_current(device) {
            return Resolution::none();
        }
        let candidates = self.current_devices();
        if let Some(source) = devices.select_source(&candidates, device, bytes) {
            return Resolution::from(MigrationSource::Device(source));
        }
        match &self.seed {
            Some(seed) => Resolution::from(MigrationSource::Seed(Arc::clone(seed))),
            None => Resolution::none(),
        }
    }

    /// Apply the effect of a recorded access.
    ///
    /// A write leaves `device` as the only current copy; a read makes
    /// `device` current alongside the others.
    pub fn record_access(&mut self, device: DeviceId, mode: AccessMode) {
        if mode.writes() {
            for current in self.current.values_mut() {
                *current = false;
            }
        }
        self.mark_current(device);
    }

    /// Snapshot of the per-device flags.
    pub fn snapshot(&self) -> BTreeMap<DeviceId, bool> {
        self.current.clone()
    }
}
