//! Configuration management
//!
//! Static boot-time partition configuration: the split of cores between the
//! two cells, the physical memory layout (cell regions, hibernation stores,
//! hypervisor-private region), the vendor to cell device-ownership table and
//! the switch timing parameters. Immutable once the hypervisor has booted.

use crate::cell::CellId;
use crate::utils::{GIB, MIB};
use crate::{Error, Result};

/// Accounting unit for hibernation images
pub const HIBERNATION_BLOCK_SIZE: u64 = 2 * MIB;

/// Default bound on the freeze/thaw rendezvous (100 ms)
pub const DEFAULT_FREEZE_TIMEOUT_US: u64 = 100_000;

/// PCI vendor ids used by the default ownership table
pub const VENDOR_AMD: u16 = 0x1002;
pub const VENDOR_NVIDIA: u16 = 0x10DE;

/// One entry of the vendor to cell ownership table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorOwner {
    /// PCI vendor id
    pub vendor: u16,
    /// Cell that initially owns devices from this vendor
    pub owner: CellId,
}

/// Default ownership table: AMD graphics to Linux, NVIDIA to Windows
pub static DEFAULT_DEVICE_OWNERS: [VendorOwner; 2] = [
    VendorOwner {
        vendor: VENDOR_AMD,
        owner: CellId::Linux,
    },
    VendorOwner {
        vendor: VENDOR_NVIDIA,
        owner: CellId::Windows,
    },
];

/// Memory layout of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLayout {
    /// Base of the cell's memory region (also its entry point)
    pub memory_base: u64,
    /// Size of the cell's memory region
    pub memory_size: u64,
    /// Base of the hibernation store
    pub hibernation_base: u64,
    /// Capacity of the hibernation store
    pub hibernation_size: u64,
}

/// Partition configuration
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Cores given to the Linux cell, `None` for half rounded up
    pub linux_cores: Option<u32>,
    /// Base of the hypervisor-private region
    pub hypervisor_base: u64,
    /// Size of the hypervisor-private region
    pub hypervisor_size: u64,
    /// Guest memory the two cells must jointly cover
    pub guest_memory_total: u64,
    /// Per-cell layout, indexed by [`CellId::index`]
    pub cells: [CellLayout; 2],
    /// Initial owner of display devices by vendor
    pub device_owners: &'static [VendorOwner],
    /// Bound on every freeze/thaw rendezvous
    pub freeze_timeout_us: u64,
    /// Accounting and copy unit of hibernation images
    pub hibernation_block_size: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            linux_cores: None,
            hypervisor_base: MIB,
            hypervisor_size: 256 * MIB,
            guest_memory_total: 32 * GIB,
            cells: [
                CellLayout {
                    memory_base: 4 * GIB,
                    memory_size: 16 * GIB,
                    hibernation_base: 36 * GIB,
                    hibernation_size: 16 * GIB,
                },
                CellLayout {
                    memory_base: 20 * GIB,
                    memory_size: 16 * GIB,
                    hibernation_base: 52 * GIB,
                    hibernation_size: 16 * GIB,
                },
            ],
            device_owners: &DEFAULT_DEVICE_OWNERS,
            freeze_timeout_us: DEFAULT_FREEZE_TIMEOUT_US,
            hibernation_block_size: HIBERNATION_BLOCK_SIZE,
        }
    }
}

impl PartitionConfig {
    /// Layout of `cell`
    pub fn cell(&self, cell: CellId) -> &CellLayout {
        &self.cells[cell.index()]
    }

    /// Initial owner of display devices from `vendor`
    pub fn owner_for_vendor(&self, vendor: u16) -> Option<CellId> {
        self.device_owners
            .iter()
            .find(|entry| entry.vendor == vendor)
            .map(|entry| entry.owner)
    }

    /// Validate the layout
    ///
    /// Rejects empty regions, cells that do not cover the guest total, stores
    /// smaller than their cell, and any overlap between the two cell regions,
    /// the two stores and the hypervisor region.
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor_size == 0 {
            return Err(Error::Config("hypervisor region is empty"));
        }

        let mut covered = 0u64;
        for layout in &self.cells {
            if layout.memory_size == 0 {
                return Err(Error::Config("cell memory region is empty"));
            }
            if layout.hibernation_size < layout.memory_size {
                return Err(Error::Config("hibernation store smaller than cell memory"));
            }
            covered = covered
                .checked_add(layout.memory_size)
                .ok_or(Error::Config("cell memory size overflows"))?;
        }
        if covered != self.guest_memory_total {
            return Err(Error::Config("cell memory does not cover guest total"));
        }

        let regions = [
            (self.hypervisor_base, self.hypervisor_size),
            (self.cells[0].memory_base, self.cells[0].memory_size),
            (self.cells[1].memory_base, self.cells[1].memory_size),
            (self.cells[0].hibernation_base, self.cells[0].hibernation_size),
            (self.cells[1].hibernation_base, self.cells[1].hibernation_size),
        ];
        for (i, &(base, size)) in regions.iter().enumerate() {
            let end = base
                .checked_add(size)
                .ok_or(Error::Config("region end overflows"))?;
            for &(other_base, other_size) in &regions[i + 1..] {
                if base < other_base.saturating_add(other_size) && other_base < end {
                    return Err(Error::Config("memory regions overlap"));
                }
            }
        }

        if !self.hibernation_block_size.is_power_of_two() {
            return Err(Error::Config("hibernation block size is not a power of two"));
        }
        if self.freeze_timeout_us == 0 {
            return Err(Error::Config("freeze timeout is zero"));
        }
        if let Some(0) = self.linux_cores {
            return Err(Error::Config("linux cell needs at least one core"));
        }

        Ok(())
    }
}

#[cfg(test)]
impl PartitionConfig {
    /// Two 8 MiB cells so simulated copies stay small
    pub(crate) fn small() -> Self {
        Self {
            hypervisor_size: 16 * MIB,
            guest_memory_total: 16 * MIB,
            cells: [
                CellLayout {
                    memory_base: 64 * MIB,
                    memory_size: 8 * MIB,
                    hibernation_base: 128 * MIB,
                    hibernation_size: 8 * MIB,
                },
                CellLayout {
                    memory_base: 72 * MIB,
                    memory_size: 8 * MIB,
                    hibernation_base: 136 * MIB,
                    hibernation_size: 8 * MIB,
                },
            ],
            ..Self::default()
        }
    }
}
