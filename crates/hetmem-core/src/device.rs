//! Device registry and transfer topology.
//!
//! A [`DeviceSet`] is the explicit list of compute targets known to a
//! runtime. Devices are identified by their registration order, which is
//! also the deterministic tie-break when choosing a migration source.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{HetmemError, Result};
use crate::memory::DeviceMemory;

/// Identifier of a device within a [`DeviceSet`] (its registration index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a device id from a registration index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the registration index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Kind of compute target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// The host CPU.
    Host,
    /// A discrete or integrated GPU.
    Gpu,
    /// Any other accelerator.
    Accelerator,
}

impl DeviceKind {
    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Host => "Host",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Accelerator => "Accelerator",
        }
    }
}

/// Information about a device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Device kind.
    pub kind: DeviceKind,
    /// Whether device supports P2P with other devices.
    pub p2p_capable: bool,
    /// Whether device memory is host addressable (unified memory).
    pub unified_memory: bool,
}

impl DeviceInfo {
    /// Create a new device info.
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            p2p_capable: false,
            unified_memory: matches!(kind, DeviceKind::Host),
        }
    }

    /// Mark the device as P2P capable.
    pub fn with_p2p(mut self, enabled: bool) -> Self {
        self.p2p_capable = enabled;
        self
    }

    /// Mark the device memory as host addressable.
    pub fn with_unified_memory(mut self, enabled: bool) -> Self {
        self.unified_memory = enabled;
        self
    }
}

/// Interconnect between two devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterconnectType {
    /// Same physical memory (no copy required beyond a memcpy).
    SameMemory,
    /// Direct high-bandwidth GPU link.
    NvLink,
    /// Direct PCIe peer transfer.
    Pcie,
    /// Transfer staged through host memory.
    HostStaged,
}

impl InterconnectType {
    /// Approximate bandwidth in bytes per microsecond.
    pub fn bandwidth(&self) -> u64 {
        match self {
            InterconnectType::SameMemory => 100_000,
            InterconnectType::NvLink => 50_000,
            InterconnectType::Pcie => 16_000,
            InterconnectType::HostStaged => 6_000,
        }
    }

    /// Fixed latency in microseconds.
    pub fn latency(&self) -> u64 {
        match self {
            InterconnectType::SameMemory => 0,
            InterconnectType::NvLink => 2,
            InterconnectType::Pcie => 5,
            InterconnectType::HostStaged => 10,
        }
    }
}

/// Cost model used to pick a migration source device.
pub trait TransferCostModel: Send + Sync {
    /// Estimated cost of moving `bytes` from `from` to `to`.
    ///
    /// `None` means the model has no estimate for this pair.
    fn transfer_cost(&self, from: DeviceId, to: DeviceId, bytes: usize) -> Option<u64>;
}

/// Cost model derived from a table of device interconnects.
#[derive(Debug, Clone, Default)]
pub struct TopologyCostModel {
    links: HashMap<(DeviceId, DeviceId), InterconnectType>,
}

impl TopologyCostModel {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bidirectional link.
    pub fn with_link(mut self, a: DeviceId, b: DeviceId, link: InterconnectType) -> Self {
        self.links.insert((a, b), link);
        self.links.insert((b, a), link);
        self
    }

    /// Get the link between two devices.
    pub fn link(&self, from: DeviceId, to: DeviceId) -> Option<InterconnectType> {
        if from == to {
            return Some(InterconnectType::SameMemory);
        }
        self.links.get(&(from, to)).copied()
    }
}

impl TransferCostModel for TopologyCostModel {
    fn transfer_cost(&self, from: DeviceId, to: DeviceId, bytes: usize) -> Option<u64> {
        self.link(from, to)
            .map(|link| link.latency() + bytes as u64 / link.bandwidth().max(1))
    }
}

struct DeviceEntry {
    info: DeviceInfo,
    memory: Arc<dyn DeviceMemory>,
}

/// The set of compute targets known to a runtime.
pub struct DeviceSet {
    devices: Vec<DeviceEntry>,
    cost_model: Option<Arc<dyn TransferCostModel>>,
}

impl DeviceSet {
    /// Create a new builder.
    pub fn builder() -> DeviceSetBuilder {
        DeviceSetBuilder::new()
    }

    /// Get number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Check whether a device is registered.
    pub fn contains(&self, device: DeviceId) -> bool {
        device.index() < self.devices.len()
    }

    /// Fail with `UnknownDevice` unless the device is registered.
    pub fn check(&self, device: DeviceId) -> Result<()> {
        if self.contains(device) {
            Ok(())
        } else {
            Err(HetmemError::UnknownDevice(device))
        }
    }

    /// All device ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        (0..self.devices.len()).map(|i| DeviceId::new(i as u32))
    }

    /// Get device info.
    pub fn info(&self, device: DeviceId) -> Result<&DeviceInfo> {
        self.devices
            .get(device.index())
            .map(|e| &e.info)
            .ok_or(HetmemError::UnknownDevice(device))
    }

    /// Get the allocator of a device.
    pub fn memory(&self, device: DeviceId) -> Result<&Arc<dyn DeviceMemory>> {
        self.devices
            .get(device.index())
            .map(|e| &e.memory)
            .ok_or(HetmemError::UnknownDevice(device))
    }

    /// First registered host device, if any.
    pub fn host(&self) -> Option<DeviceId> {
        self.ids()
            .find(|id| self.devices[id.index()].info.kind == DeviceKind::Host)
    }

    /// Check if P2P is available between two devices.
    pub fn can_p2p(&self, a: DeviceId, b: DeviceId) -> bool {
        match (self.devices.get(a.index()), self.devices.get(b.index())) {
            (Some(a), Some(b)) => a.info.p2p_capable && b.info.p2p_capable,
            _ => false,
        }
    }

    /// Choose the device to copy from when `target` needs current data.
    ///
    /// Candidates with a cost estimate are preferred, cheapest first.
    /// Ties and unestimated candidates fall back to registration order.
    pub fn select_source(
        &self,
        candidates: &[DeviceId],
        target: DeviceId,
        bytes: usize,
    ) -> Option<DeviceId> {
        candidates
            .iter()
            .copied()
            .filter(|&d| d != target)
            .min_by_key(|&d| {
                let cost = self
                    .cost_model
                    .as_ref()
                    .and_then(|m| m.transfer_cost(d, target, bytes));
                (cost.is_none(), cost.unwrap_or(0), d)
            })
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSet")
            .field(
                "devices",
                &self.devices.iter().map(|e| &e.info).collect::<Vec<_>>(),
            )
            .field("cost_model", &self.cost_model.is_some())
            .finish()
    }
}

/// Builder for a [`DeviceSet`].
#[derive(Default)]
pub struct DeviceSetBuilder {
    devices: Vec<DeviceEntry>,
    cost_model: Option<Arc<dyn TransferCostModel>>,
}

impl DeviceSetBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Ids are assigned in registration order.
    pub fn device(mut self, info: DeviceInfo, memory: Arc<dyn DeviceMemory>) -> Self {
        self.devices.push(DeviceEntry { info, memory });
        self
    }

    /// Set the migration source cost model.
    pub fn cost_model(mut self, model: impl TransferCostModel + 'static) -> Self {
        self.cost_model = Some(Arc::new(model));
        self
    }

    /// Build the device set.
    pub fn build(self) -> Result<DeviceSet> {
        if self.devices.is_empty() {
            return Err(HetmemError::InvalidConfig(
                "device set must contain at least one device".to_string(),
            ));
        }
        if self.devices.len() > u32::MAX as usize {
            return Err(HetmemError::InvalidConfig("too many devices".to_string()));
        }
        Ok(DeviceSet {
            devices: self.devices,
            cost_model: self.cost_model,
        })
    }
}
