//! Memory partitioning
//!
//! Three static regions are fixed at boot: one memory range per cell and the
//! hypervisor-private range, which backs a bump allocator. Containment uses
//! half-open intervals throughout.

use core::fmt;

use crate::cell::CellId;
use crate::config::PartitionConfig;
use crate::Result;

pub mod bump;

pub use bump::{BumpAllocator, BumpStats};

/// Physical address type
pub type PhysAddr = u64;

/// Owner of a memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOwner {
    Cell(CellId),
    Hypervisor,
}

impl fmt::Display for RegionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionOwner::Cell(cell) => write!(f, "{}", cell),
            RegionOwner::Hypervisor => write!(f, "hypervisor"),
        }
    }
}

/// Memory region descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRegion {
    /// Start physical address
    pub base: PhysAddr,
    /// Size in bytes
    pub size: u64,
    /// Human-readable label
    pub label: &'static str,
    pub owner: RegionOwner,
}

impl ResourceRegion {
    /// One past the last byte
    pub fn end(&self) -> PhysAddr {
        self.base.saturating_add(self.size)
    }

    /// Check if `addr` lies in `[base, base + size)`
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.base <= addr && addr < self.end()
    }

    pub fn overlaps(&self, other: &ResourceRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

const LINUX_REGION: usize = 0;
const WINDOWS_REGION: usize = 1;
const HYPERVISOR_REGION: usize = 2;

/// Static memory layout with the hypervisor allocator
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    regions: [ResourceRegion; 3],
    allocator: BumpAllocator,
}

impl MemoryPartition {
    /// Build the layout from a validated configuration
    pub fn new(config: &PartitionConfig) -> Self {
        let linux = config.cell(CellId::Linux);
        let windows = config.cell(CellId::Windows);

        let regions = [
            ResourceRegion {
                base: linux.memory_base,
                size: linux.memory_size,
                label: "linux memory",
                owner: RegionOwner::Cell(CellId::Linux),
            },
            ResourceRegion {
                base: windows.memory_base,
                size: windows.memory_size,
                label: "windows memory",
                owner: RegionOwner::Cell(CellId::Windows),
            },
            ResourceRegion {
                base: config.hypervisor_base,
                size: config.hypervisor_size,
                label: "hypervisor private",
                owner: RegionOwner::Hypervisor,
            },
        ];

        Self {
            regions,
            allocator: BumpAllocator::new(config.hypervisor_base, config.hypervisor_size),
        }
    }

    pub fn regions(&self) -> &[ResourceRegion] {
        &self.regions
    }

    /// Memory region of `cell`
    pub fn cell_region(&self, cell: CellId) -> &ResourceRegion {
        match cell {
            CellId::Linux => &self.regions[LINUX_REGION],
            CellId::Windows => &self.regions[WINDOWS_REGION],
        }
    }

    pub fn hypervisor_region(&self) -> &ResourceRegion {
        &self.regions[HYPERVISOR_REGION]
    }

    /// Check if `addr` lies in `cell`'s memory region
    pub fn is_owned_by(&self, addr: PhysAddr, cell: CellId) -> bool {
        self.cell_region(cell).contains(addr)
    }

    /// Owner of the region containing `addr`
    pub fn owner_of(&self, addr: PhysAddr) -> Option<RegionOwner> {
        self.regions
            .iter()
            .find(|region| region.contains(addr))
            .map(|region| region.owner)
    }

    /// Allocate from the hypervisor-private region
    pub fn allocate(&mut self, size: u64) -> Result<PhysAddr> {
        self.allocator.allocate(size)
    }

    /// Allocate `size` bytes aligned to `align`
    pub fn allocate_aligned(&mut self, size: u64, align: u64) -> Result<PhysAddr> {
        self.allocator.allocate_aligned(size, align)
    }

    /// Return memory to the hypervisor region (never reclaimed)
    pub fn free(&mut self, addr: PhysAddr, size: u64) {
        self.allocator.free(addr, size);
    }

    pub fn allocator_stats(&self) -> BumpStats {
        self.allocator.stats()
    }

    /// Region table for the boot log
    pub fn layout(&self) -> LayoutTable<'_> {
        LayoutTable(self)
    }
}

/// Printable region table
pub struct LayoutTable<'a>(&'a MemoryPartition);

impl fmt::Display for LayoutTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in self.0.regions() {
            writeln!(
                f,
                "  {:#014x}-{:#014x} {:>6} MiB  {} ({})",
                region.base,
                region.end(),
                region.size / crate::utils::MIB,
                region.label,
                region.owner
            )?;
        }
        let stats = self.0.allocator_stats();
        write!(f, "  hypervisor allocator: {} bytes used, {} free", stats.used, stats.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{GIB, MIB};
    use crate::Error;

    fn partition() -> MemoryPartition {
        MemoryPartition::new(&PartitionConfig::default())
    }

    #[test]
    fn test_default_split() {
        let mm = partition();
        let linux = mm.cell_region(CellId::Linux);
        let windows = mm.cell_region(CellId::Windows);

        assert_eq!(linux.size, 16 * GIB);
        assert_eq!(windows.size, 16 * GIB);
        assert_eq!(linux.size + windows.size, 32 * GIB);
        assert!(!linux.overlaps(windows));
        assert!(!linux.overlaps(mm.hypervisor_region()));
        assert!(!windows.overlaps(mm.hypervisor_region()));
    }

    #[test]
    fn test_half_open_containment() {
        let mm = partition();
        let linux = *mm.cell_region(CellId::Linux);

        assert!(mm.is_owned_by(linux.base, CellId::Linux));
        assert!(mm.is_owned_by(linux.end() - 1, CellId::Linux));
        assert!(!mm.is_owned_by(linux.end(), CellId::Linux));
        assert!(!mm.is_owned_by(linux.base - 1, CellId::Linux));

        // The first byte past linux belongs to windows
        assert!(mm.is_owned_by(linux.end(), CellId::Windows));
        assert_eq!(mm.owner_of(linux.end()), Some(RegionOwner::Cell(CellId::Windows)));
    }

    #[test]
    fn test_owner_of() {
        let mm = partition();
        assert_eq!(mm.owner_of(MIB), Some(RegionOwner::Hypervisor));
        assert_eq!(mm.owner_of(0), None);
        assert_eq!(mm.owner_of(36 * GIB), None);
    }

    #[test]
    fn test_hypervisor_allocation() {
        let mut mm = partition();
        let base = mm.hypervisor_region().base;

        assert_eq!(mm.allocate(4096), Ok(base));
        // Base sits at 1 MiB, so the next 2 MiB boundary is one MiB above it
        assert_eq!(mm.allocate_aligned(64, 2 * MIB), Ok(base + MIB));
        assert_eq!(mm.allocate(256 * MIB), Err(Error::ResourceExhausted));
        assert_eq!(mm.allocator_stats().used, MIB + 64);
    }

    #[test]
    fn test_layout_lists_every_region() {
        let text = partition().layout().to_string();
        assert!(text.contains("linux memory (linux)"));
        assert!(text.contains("windows memory (windows)"));
        assert!(text.contains("hypervisor private (hypervisor)"));
    }
}
