//! Hypervisor context
//!
//! [`Hypervisor`] is the single value the boot path creates and keeps for the
//! lifetime of the machine. It owns the platform and every partitioned
//! resource, and is the only way the outside world (input handling, status
//! display, device I/O validation) talks to the control plane.

use alloc::sync::Arc;

use crate::arch::Platform;
use crate::cell::{CellId, CellState, CellStateMachine};
use crate::config::PartitionConfig;
use crate::cpu::{enable_features, CpuFeatures, CpuTopology};
use crate::iommu::pci::{MAX_DEVICES, MAX_FUNCTIONS};
use crate::iommu::{IommuDeviceDirectory, IsolationMode, PciDeviceAddress};
use crate::mm::{MemoryPartition, PhysAddr};
use crate::switch::{StatusBoard, StatusSnapshot, SwitchCoordinator};
use crate::{Error, Result, VERSION};

/// External trigger delivered to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The switch hotkey was pressed
    SwitchRequested,
}

/// The booted control plane
pub struct Hypervisor<P: Platform> {
    platform: P,
    config: PartitionConfig,
    topology: CpuTopology,
    features: CpuFeatures,
    memory: MemoryPartition,
    iommu: IommuDeviceDirectory,
    isolation: IsolationMode,
    cells: CellStateMachine,
    switch: SwitchCoordinator,
}

impl<P: Platform> Hypervisor<P> {
    /// Bring up every component from `config`
    ///
    /// Only an invalid configuration fails boot. Missing hardware features and
    /// a missing or unverifiable IOMMU are logged and boot continues, the
    /// latter in degraded isolation mode. Standby cores that fail to park
    /// leave the Windows cell in `Error`.
    pub fn boot(mut platform: P, config: PartitionConfig) -> Result<Self> {
        log::info!("Concordia v{} starting", VERSION);
        config.validate()?;

        let topology = CpuTopology::probe(&platform, config.linux_cores);
        let features = enable_features(&mut platform);

        let memory = MemoryPartition::new(&config);
        log::info!("memory layout:\n{}", memory.layout());

        let mut iommu = IommuDeviceDirectory::new();
        let isolation = iommu.init(&mut platform, &config);

        let mut cells = CellStateMachine::new(&config, &topology);
        cells.boot(&mut platform)?;
        let switch = SwitchCoordinator::new(&cells, isolation, iommu.status());

        log::info!("boot complete, {} active", switch.active_cell());
        Ok(Self {
            platform,
            config,
            topology,
            features,
            memory,
            iommu,
            isolation,
            cells,
            switch,
        })
    }

    /// Dispatch an external event
    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::SwitchRequested => self.switch_cells().map(|_| ()),
        }
    }

    /// Hand the machine to the other cell, returning the new active cell
    pub fn switch_cells(&mut self) -> Result<CellId> {
        self.switch.switch_cells(&mut self.platform, &mut self.cells)
    }

    pub fn active_cell(&self) -> CellId {
        self.switch.active_cell()
    }

    /// Latest published status
    pub fn status(&self) -> StatusSnapshot {
        self.switch.board().snapshot()
    }

    /// Status handle for readers outside the control thread
    pub fn status_board(&self) -> Arc<StatusBoard> {
        self.switch.board()
    }

    /// Check whether the device at `bus:device.function` belongs to Linux
    ///
    /// Addresses that cannot exist, or devices outside every group, are not
    /// Linux devices.
    pub fn is_linux_device(&self, bus: u8, device: u8, function: u8) -> bool {
        if device >= MAX_DEVICES || function >= MAX_FUNCTIONS {
            return false;
        }
        self.iommu
            .is_linux_device(PciDeviceAddress::new(bus, device, function))
    }

    /// Cell owning `addr`
    pub fn device_owner(&self, addr: PciDeviceAddress) -> Option<CellId> {
        self.iommu.owner_of(addr)
    }

    /// Move a device to `target`
    ///
    /// Refused with `InvalidState` while the current owner is running, since
    /// the device may have DMA in flight.
    pub fn reassign_device(&mut self, addr: PciDeviceAddress, target: CellId) -> Result<()> {
        let current = self
            .iommu
            .owner_of(addr)
            .ok_or(Error::Config("device is not in any IOMMU group"))?;
        if current == target {
            return Ok(());
        }
        if self.cells.state(current) == CellState::Running {
            log::warn!("refusing to move {} away from running cell {}", addr, current);
            return Err(Error::InvalidState);
        }
        self.iommu.assign(addr, target)
    }

    /// Allocate from the hypervisor-private region
    pub fn allocate(&mut self, size: u64) -> Result<PhysAddr> {
        self.memory.allocate(size)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    pub fn memory(&self) -> &MemoryPartition {
        &self.memory
    }

    pub fn iommu(&self) -> &IommuDeviceDirectory {
        &self.iommu
    }

    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    pub fn cells(&self) -> &CellStateMachine {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;
    use crate::config::{VENDOR_AMD, VENDOR_NVIDIA};
    use crate::iommu::IommuStatus;

    const AMD_GPU: PciDeviceAddress = PciDeviceAddress::new(3, 0, 0);
    const NVIDIA_GPU: PciDeviceAddress = PciDeviceAddress::new(4, 0, 0);

    fn reference_machine() -> SimPlatform {
        let mut sim = SimPlatform::new(12);
        sim.add_amd_iommu(PciDeviceAddress::new(0, 0, 2), 0xFEB8_0000);
        sim.add_pci_device(AMD_GPU, VENDOR_AMD, 0x73BF, 0x03);
        sim.add_pci_device(NVIDIA_GPU, VENDOR_NVIDIA, 0x2684, 0x03);
        sim
    }

    fn boot() -> Hypervisor<SimPlatform> {
        Hypervisor::boot(reference_machine(), PartitionConfig::small()).unwrap()
    }

    #[test]
    fn test_boot_reference_machine() {
        let hv = Hypervisor::boot(reference_machine(), PartitionConfig::default()).unwrap();

        assert_eq!(hv.active_cell(), CellId::Linux);
        assert_eq!(hv.topology().total_cores(), 12);
        assert_eq!(hv.features(), CpuFeatures::all());
        assert_eq!(hv.isolation(), IsolationMode::Enforced);
        assert_eq!(hv.iommu().groups().len(), 2);

        let status = hv.status();
        assert_eq!(status.cell(CellId::Linux).state, CellState::Running);
        assert_eq!(status.cell(CellId::Windows).state, CellState::Hibernated);
        assert_eq!(status.cell(CellId::Linux).cores, 6);
        assert_eq!(status.iommu, IommuStatus::Enforcing);
    }

    #[test]
    fn test_boot_without_iommu_is_degraded() {
        let hv = Hypervisor::boot(SimPlatform::new(4), PartitionConfig::small()).unwrap();
        assert_eq!(hv.isolation(), IsolationMode::Degraded);
        assert_eq!(hv.status().iommu.to_string(), "Not detected");
    }

    #[test]
    fn test_standby_core_that_never_parks() {
        let mut sim = reference_machine();
        sim.make_unresponsive(8);
        let mut hv = Hypervisor::boot(sim, PartitionConfig::small()).unwrap();

        let status = hv.status();
        assert_eq!(status.cell(CellId::Linux).state, CellState::Running);
        assert_eq!(status.cell(CellId::Windows).state, CellState::Error);
        assert_eq!(hv.switch_cells(), Err(Error::InvalidState));
        assert_eq!(hv.active_cell(), CellId::Linux);
    }

    #[test]
    fn test_invalid_config_fails_boot() {
        let mut config = PartitionConfig::small();
        config.cells[1].memory_base = config.cells[0].memory_base;
        assert!(matches!(
            Hypervisor::boot(reference_machine(), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_switch_events_keep_one_cell_running() {
        let mut hv = boot();

        for round in 1..=5u64 {
            hv.handle_event(Event::SwitchRequested).unwrap();
            let status = hv.status();
            assert_eq!(status.running_cells(), 1);
            assert_eq!(status.switch_count, round);
            assert_eq!(hv.cells().running_cell(), Some(hv.active_cell()));
        }
        assert_eq!(hv.active_cell(), CellId::Windows);
    }

    #[test]
    fn test_device_queries() {
        let hv = boot();
        assert!(hv.is_linux_device(3, 0, 0));
        assert!(!hv.is_linux_device(4, 0, 0));
        assert!(!hv.is_linux_device(3, 40, 0));
        assert!(!hv.is_linux_device(3, 0, 9));
        assert_eq!(hv.device_owner(NVIDIA_GPU), Some(CellId::Windows));
    }

    #[test]
    fn test_reassignment_guard() {
        let mut hv = boot();

        // Linux is running, its GPU stays put
        assert_eq!(hv.reassign_device(AMD_GPU, CellId::Windows), Err(Error::InvalidState));
        assert_eq!(hv.device_owner(AMD_GPU), Some(CellId::Linux));

        // Windows is hibernated, its GPU can move
        assert_eq!(hv.reassign_device(NVIDIA_GPU, CellId::Linux), Ok(()));
        assert_eq!(hv.device_owner(NVIDIA_GPU), Some(CellId::Linux));

        // After a switch the roles flip
        hv.switch_cells().unwrap();
        assert_eq!(hv.reassign_device(AMD_GPU, CellId::Windows), Ok(()));
        assert_eq!(hv.reassign_device(AMD_GPU, CellId::Linux), Err(Error::InvalidState));
        // Already owned by the target is a no-op even while running
        assert_eq!(hv.reassign_device(AMD_GPU, CellId::Windows), Ok(()));
    }

    #[test]
    fn test_reassign_unknown_device() {
        let mut hv = boot();
        assert!(matches!(
            hv.reassign_device(PciDeviceAddress::new(7, 0, 0), CellId::Linux),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_hypervisor_allocation() {
        let mut hv = boot();
        let base = hv.memory().hypervisor_region().base;
        assert_eq!(hv.allocate(4096), Ok(base));
        assert_eq!(hv.allocate(4096), Ok(base + 4096));
        assert_eq!(hv.allocate(64 * crate::utils::MIB), Err(Error::ResourceExhausted));
    }
}
