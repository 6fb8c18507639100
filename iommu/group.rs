//! IOMMU groups
//!
//! A group is the unit of DMA isolation: all member devices share one
//! translation domain, so they always belong to the same cell. Ownership is
//! stored once per group, which makes reassignment a single write.

use crate::cell::CellId;
use crate::iommu::pci::PciDeviceAddress;
use crate::{Error, Result};

/// Maximum number of groups the directory tracks
pub const MAX_IOMMU_GROUPS: usize = 64;
/// Maximum number of devices per group
pub const MAX_GROUP_DEVICES: usize = 16;

/// Devices sharing one translation domain, owned by one cell
#[derive(Debug, Clone)]
pub struct IommuGroup {
    id: u32,
    owner: CellId,
    devices: heapless::Vec<PciDeviceAddress, MAX_GROUP_DEVICES>,
}

impl IommuGroup {
    /// Create an empty group owned by `owner`
    pub fn new(id: u32, owner: CellId) -> Self {
        Self {
            id,
            owner,
            devices: heapless::Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cell owning every device of the group
    pub fn owner(&self) -> CellId {
        self.owner
    }

    /// Hand the whole group to `owner`
    pub fn set_owner(&mut self, owner: CellId) {
        self.owner = owner;
    }

    pub fn devices(&self) -> &[PciDeviceAddress] {
        &self.devices
    }

    pub fn contains(&self, addr: PciDeviceAddress) -> bool {
        self.devices.contains(&addr)
    }

    /// Add a member device
    pub fn add_device(&mut self, addr: PciDeviceAddress) -> Result<()> {
        if self.contains(addr) {
            return Ok(());
        }
        self.devices.push(addr).map_err(|_| Error::ResourceExhausted)
    }
}
