//! IOMMU device directory
//!
//! Finds the DMA translation controller, groups the passthrough display
//! devices, tracks which cell owns each group and switches translation
//! enforcement on. Without working enforcement the machine still boots, but
//! in a loudly flagged degraded mode where device isolation is not
//! guaranteed.

use core::fmt;
use core::ops::RangeInclusive;

use bitflags::bitflags;

use crate::arch::Platform;
use crate::cell::CellId;
use crate::config::PartitionConfig;
use crate::{Capability, Error, Result};

pub mod group;
pub mod pci;

pub use group::{IommuGroup, MAX_IOMMU_GROUPS};
pub use pci::PciDeviceAddress;

/// Offset of the control register in the AMD-Vi MMIO window
pub const AMDVI_CONTROL_OFFSET: u64 = 0x18;
/// Secure-device capability id carrying the AMD-Vi MMIO base
pub const AMDVI_CAPABILITY_ID: u8 = 0x0F;

/// MMIO base is 4 KiB aligned
const MMIO_BASE_MASK: u32 = 0xFFFF_F000;

bitflags! {
    /// Translation controller control register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        /// Translation enforcement
        const ENABLE = 1 << 0;
        /// Coherent DMA
        const COHERENT = 1 << 17;
    }
}

/// Translation controller family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuKind {
    AmdVi,
}

struct ControllerMatch {
    vendor: u16,
    devices: RangeInclusive<u16>,
    kind: IommuKind,
}

const KNOWN_CONTROLLERS: &[ControllerMatch] = &[ControllerMatch {
    vendor: 0x1022,
    devices: 0x1447..=0x1457,
    kind: IommuKind::AmdVi,
}];

/// A detected translation controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationController {
    pub addr: PciDeviceAddress,
    pub kind: IommuKind,
    /// Physical base of the MMIO register window
    pub base: u64,
}

impl TranslationController {
    /// Physical address of the control register
    pub fn control_register(&self) -> u64 {
        self.base + AMDVI_CONTROL_OFFSET
    }
}

/// Whether device isolation is hardware-enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    Enforced,
    /// Passthrough devices are not confined to their cell
    Degraded,
}

/// Translation state reported through the status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuStatus {
    NotDetected,
    /// Present but enforcement not (yet) enabled
    Detected,
    Enforcing,
    /// Enable bits did not read back
    VerificationFailed,
}

impl fmt::Display for IommuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IommuStatus::NotDetected => "Not detected",
            IommuStatus::Detected => "Detected, not enforcing",
            IommuStatus::Enforcing => "Enforcing",
            IommuStatus::VerificationFailed => "Verification failed",
        };
        f.write_str(text)
    }
}

/// Device groups, their owners and the translation controller
#[derive(Debug, Clone, Default)]
pub struct IommuDeviceDirectory {
    controller: Option<TranslationController>,
    groups: heapless::Vec<IommuGroup, MAX_IOMMU_GROUPS>,
    enforcing: bool,
    verification_failed: bool,
}

impl IommuDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan bus 0 for a known translation controller
    ///
    /// Every function of a multi-function device is checked, AMD places the
    /// controller at function 2 of the host bridge.
    pub fn detect<P: Platform + ?Sized>(&mut self, platform: &P) -> Result<TranslationController> {
        self.controller = None;

        for device in 0..pci::MAX_DEVICES {
            let base = PciDeviceAddress::new(0, device, 0);
            if pci::read_identity(platform, base).is_none() {
                continue;
            }
            let functions = if pci::is_multifunction(platform, base) {
                pci::MAX_FUNCTIONS
            } else {
                1
            };

            for function in 0..functions {
                let addr = PciDeviceAddress::new(0, device, function);
                if let Some(controller) = probe_controller(platform, addr) {
                    log::info!(
                        "IOMMU: {:?} at {}, MMIO base {:#x}",
                        controller.kind,
                        addr,
                        controller.base
                    );
                    self.controller = Some(controller);
                    return Ok(controller);
                }
            }
        }

        Err(Error::HardwareUnavailable(Capability::Iommu))
    }

    pub fn is_available(&self) -> bool {
        self.controller.is_some()
    }

    pub fn controller(&self) -> Option<&TranslationController> {
        self.controller.as_ref()
    }

    /// Build one group per display device, owned per the vendor table
    ///
    /// Display devices from vendors not in the table are skipped. Returns the
    /// number of groups; `ResourceExhausted` once the group table overflows,
    /// keeping the groups built so far.
    pub fn setup_device_groups<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        config: &PartitionConfig,
    ) -> Result<usize> {
        self.groups.clear();
        let mut overflow = false;
        let groups = &mut self.groups;

        pci::for_each_device(platform, |addr, identity| {
            if overflow || !identity.is_display() {
                return;
            }
            let owner = match config.owner_for_vendor(identity.vendor) {
                Some(owner) => owner,
                None => {
                    log::warn!(
                        "display device {} from unmapped vendor {:04x}, left unassigned",
                        addr,
                        identity.vendor
                    );
                    return;
                }
            };

            let mut group = IommuGroup::new(groups.len() as u32, owner);
            if group.add_device(addr).is_err() || groups.push(group).is_err() {
                overflow = true;
                return;
            }
            log::info!("IOMMU group {}: {} -> {}", groups.len() - 1, addr, owner);
        });

        if overflow {
            log::error!("{}: more than {} device groups", Error::ResourceExhausted, MAX_IOMMU_GROUPS);
            return Err(Error::ResourceExhausted);
        }
        Ok(self.groups.len())
    }

    pub fn groups(&self) -> &[IommuGroup] {
        &self.groups
    }

    /// Group containing `addr`
    pub fn group_of(&self, addr: PciDeviceAddress) -> Option<&IommuGroup> {
        self.groups.iter().find(|group| group.contains(addr))
    }

    /// Cell owning `addr`, `None` for devices not in any group
    pub fn owner_of(&self, addr: PciDeviceAddress) -> Option<CellId> {
        self.group_of(addr).map(IommuGroup::owner)
    }

    pub fn is_linux_device(&self, addr: PciDeviceAddress) -> bool {
        self.owner_of(addr) == Some(CellId::Linux)
    }

    /// Hand the group containing `addr` to `cell`
    ///
    /// Callers must only move devices between cells that are not running.
    pub fn assign(&mut self, addr: PciDeviceAddress, cell: CellId) -> Result<()> {
        let group = self
            .groups
            .iter_mut()
            .find(|group| group.contains(addr))
            .ok_or(Error::Config("device is not in any IOMMU group"))?;

        if group.owner() != cell {
            log::info!("IOMMU group {}: {} -> {}", group.id(), group.owner(), cell);
            group.set_owner(cell);
        }
        Ok(())
    }

    pub fn assign_to_linux(&mut self, addr: PciDeviceAddress) -> Result<()> {
        self.assign(addr, CellId::Linux)
    }

    pub fn assign_to_windows(&mut self, addr: PciDeviceAddress) -> Result<()> {
        self.assign(addr, CellId::Windows)
    }

    /// Switch translation enforcement on and verify it took effect
    pub fn enable<P: Platform + ?Sized>(&mut self, platform: &mut P) -> Result<()> {
        let controller = match self.controller {
            Some(controller) => controller,
            None => {
                self.enforcing = false;
                return Err(Error::HardwareUnavailable(Capability::Iommu));
            }
        };

        let register = controller.control_register();
        let wanted = ControlFlags::ENABLE | ControlFlags::COHERENT;
        let value = platform.mmio_read32(register) | wanted.bits();
        platform.mmio_write32(register, value);

        let readback = ControlFlags::from_bits_truncate(platform.mmio_read32(register));
        if !readback.contains(wanted) {
            self.enforcing = false;
            self.verification_failed = true;
            return Err(Error::VerificationFailure { register });
        }

        self.enforcing = true;
        self.verification_failed = false;
        log::info!("IOMMU enforcement enabled ({:?})", readback);
        Ok(())
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforcing
    }

    pub fn isolation(&self) -> IsolationMode {
        if self.enforcing {
            IsolationMode::Enforced
        } else {
            IsolationMode::Degraded
        }
    }

    pub fn status(&self) -> IommuStatus {
        match (self.controller, self.enforcing, self.verification_failed) {
            (None, _, _) => IommuStatus::NotDetected,
            (Some(_), true, _) => IommuStatus::Enforcing,
            (Some(_), false, true) => IommuStatus::VerificationFailed,
            (Some(_), false, false) => IommuStatus::Detected,
        }
    }

    /// Detect, group and enable, logging every failure
    pub fn init<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        config: &PartitionConfig,
    ) -> IsolationMode {
        if let Err(err) = self.detect(platform) {
            log::warn!("{}", err);
        }
        if let Err(err) = self.setup_device_groups(platform, config) {
            log::error!("device grouping incomplete: {}", err);
        }
        if let Err(err) = self.enable(platform) {
            log::error!("{}", err);
        }

        let mode = self.isolation();
        if mode == IsolationMode::Degraded {
            log::error!("!!! DEVICE ISOLATION NOT ENFORCED: IOMMU {} !!!", self.status());
        }
        mode
    }
}

/// Check whether `addr` is a known controller with a usable MMIO base
fn probe_controller<P: Platform + ?Sized>(
    platform: &P,
    addr: PciDeviceAddress,
) -> Option<TranslationController> {
    let identity = pci::read_identity(platform, addr)?;
    let known = KNOWN_CONTROLLERS
        .iter()
        .find(|m| m.vendor == identity.vendor && m.devices.contains(&identity.device))?;

    let cap = match pci::find_capability(platform, addr, AMDVI_CAPABILITY_ID) {
        Some(cap) => cap as u16,
        None => {
            log::warn!("IOMMU {} has no MMIO base capability", addr);
            return None;
        }
    };
    let lo = platform.pci_config_read(addr, cap + 4);
    let hi = platform.pci_config_read(addr, cap + 8);
    let base = ((hi as u64) << 32) | (lo & MMIO_BASE_MASK) as u64;
    if base == 0 {
        log::warn!("IOMMU {} reports no MMIO base", addr);
        return None;
    }

    Some(TranslationController {
        addr,
        kind: known.kind,
        base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;
    use crate::config::{VENDOR_AMD, VENDOR_NVIDIA};
    use test_case::test_case;

    const IOMMU_BASE: u64 = 0xFEB8_0000;
    const AMD_GPU: PciDeviceAddress = PciDeviceAddress::new(3, 0, 0);
    const NVIDIA_GPU: PciDeviceAddress = PciDeviceAddress::new(4, 0, 0);

    fn machine() -> SimPlatform {
        let mut sim = SimPlatform::new(12);
        sim.add_amd_iommu(PciDeviceAddress::new(0, 0, 2), IOMMU_BASE);
        sim.add_pci_device(AMD_GPU, VENDOR_AMD, 0x73BF, 0x03);
        sim.add_pci_device(NVIDIA_GPU, VENDOR_NVIDIA, 0x2684, 0x03);
        sim
    }

    fn directory(sim: &SimPlatform) -> IommuDeviceDirectory {
        let mut dir = IommuDeviceDirectory::new();
        dir.setup_device_groups(sim, &PartitionConfig::default()).unwrap();
        dir
    }

    #[test]
    fn test_detect_amd_vi() {
        let sim = machine();
        let mut dir = IommuDeviceDirectory::new();
        let controller = dir.detect(&sim).unwrap();

        assert_eq!(controller.kind, IommuKind::AmdVi);
        assert_eq!(controller.base, IOMMU_BASE);
        assert_eq!(controller.control_register(), IOMMU_BASE + 0x18);
        assert!(dir.is_available());
        assert_eq!(dir.status(), IommuStatus::Detected);
    }

    #[test]
    fn test_detect_high_base() {
        let mut sim = SimPlatform::new(2);
        sim.add_amd_iommu(PciDeviceAddress::new(0, 0, 2), 0x1_FEB8_0000);
        let mut dir = IommuDeviceDirectory::new();
        assert_eq!(dir.detect(&sim).unwrap().base, 0x1_FEB8_0000);
    }

    #[test]
    fn test_detect_ignores_unknown_devices() {
        let mut sim = SimPlatform::new(2);
        // Right vendor, device id outside the controller range
        sim.add_pci_device(PciDeviceAddress::new(0, 1, 0), 0x1022, 0x1480, 0x06);
        let mut dir = IommuDeviceDirectory::new();
        assert_eq!(dir.detect(&sim), Err(Error::HardwareUnavailable(Capability::Iommu)));
    }

    #[test]
    fn test_controller_without_base_is_unavailable() {
        let mut sim = SimPlatform::new(2);
        sim.add_host_bridge(PciDeviceAddress::new(0, 0, 0));
        sim.add_pci_device(PciDeviceAddress::new(0, 0, 2), 0x1022, 0x1451, 0x08);
        let mut dir = IommuDeviceDirectory::new();
        assert!(dir.detect(&sim).is_err());
        assert!(!dir.is_available());
    }

    #[test]
    fn test_enable_without_controller() {
        let mut sim = SimPlatform::new(2);
        let mut dir = IommuDeviceDirectory::new();
        let _ = dir.detect(&sim);

        assert_eq!(dir.enable(&mut sim), Err(Error::HardwareUnavailable(Capability::Iommu)));
        assert!(!dir.is_enforcing());
        assert_eq!(dir.status().to_string(), "Not detected");
    }

    #[test]
    fn test_enable_sets_and_verifies_bits() {
        let mut sim = machine();
        sim.set_mmio(IOMMU_BASE + AMDVI_CONTROL_OFFSET, 1 << 4);
        let mut dir = IommuDeviceDirectory::new();
        dir.detect(&sim).unwrap();

        assert_eq!(dir.enable(&mut sim), Ok(()));
        assert!(dir.is_enforcing());
        assert_eq!(
            sim.mmio_read32(IOMMU_BASE + AMDVI_CONTROL_OFFSET),
            (1 << 4) | (1 << 17) | 1
        );
        assert_eq!(dir.status(), IommuStatus::Enforcing);
    }

    #[test]
    fn test_enable_verification_failure() {
        let mut sim = machine();
        sim.stick_mmio_bits(IOMMU_BASE + AMDVI_CONTROL_OFFSET, ControlFlags::ENABLE.bits());
        let mut dir = IommuDeviceDirectory::new();
        dir.detect(&sim).unwrap();

        assert_eq!(
            dir.enable(&mut sim),
            Err(Error::VerificationFailure {
                register: IOMMU_BASE + AMDVI_CONTROL_OFFSET
            })
        );
        assert!(!dir.is_enforcing());
        assert_eq!(dir.isolation(), IsolationMode::Degraded);
        assert_eq!(dir.status(), IommuStatus::VerificationFailed);
    }

    #[test]
    fn test_two_vendors_two_groups() {
        let sim = machine();
        let dir = directory(&sim);

        assert_eq!(dir.groups().len(), 2);
        assert_eq!(dir.owner_of(AMD_GPU), Some(CellId::Linux));
        assert_eq!(dir.owner_of(NVIDIA_GPU), Some(CellId::Windows));
        assert!(dir.is_linux_device(AMD_GPU));
        assert!(!dir.is_linux_device(NVIDIA_GPU));
    }

    #[test]
    fn test_unmapped_and_non_display_devices_skipped() {
        let mut sim = machine();
        sim.add_pci_device(PciDeviceAddress::new(5, 0, 0), 0x8086, 0x56A0, 0x03);
        sim.add_pci_device(PciDeviceAddress::new(6, 0, 0), VENDOR_NVIDIA, 0x1234, 0x02);
        let dir = directory(&sim);

        assert_eq!(dir.groups().len(), 2);
        assert_eq!(dir.owner_of(PciDeviceAddress::new(5, 0, 0)), None);
        assert_eq!(dir.owner_of(PciDeviceAddress::new(6, 0, 0)), None);
    }

    #[test_case(CellId::Linux, CellId::Windows ; "linux then windows")]
    #[test_case(CellId::Windows, CellId::Linux ; "windows then linux")]
    fn test_last_assignment_wins(first: CellId, second: CellId) {
        let sim = machine();
        let mut dir = directory(&sim);

        dir.assign(AMD_GPU, first).unwrap();
        dir.assign(AMD_GPU, second).unwrap();
        assert_eq!(dir.owner_of(AMD_GPU), Some(second));
    }

    #[test]
    fn test_assign_helpers() {
        let sim = machine();
        let mut dir = directory(&sim);

        dir.assign_to_linux(NVIDIA_GPU).unwrap();
        assert!(dir.is_linux_device(NVIDIA_GPU));
        dir.assign_to_windows(NVIDIA_GPU).unwrap();
        assert!(!dir.is_linux_device(NVIDIA_GPU));
    }

    #[test]
    fn test_unknown_device_assignment_rejected() {
        let sim = machine();
        let mut dir = directory(&sim);

        let unknown = PciDeviceAddress::new(9, 0, 0);
        assert!(matches!(dir.assign_to_linux(unknown), Err(Error::Config(_))));
        assert_eq!(dir.owner_of(AMD_GPU), Some(CellId::Linux));
        assert_eq!(dir.owner_of(NVIDIA_GPU), Some(CellId::Windows));
    }

    #[test]
    fn test_group_table_overflow() {
        let mut sim = SimPlatform::new(2);
        for i in 0..(MAX_IOMMU_GROUPS + 2) {
            let addr = PciDeviceAddress::new(1 + (i / 32) as u8, (i % 32) as u8, 0);
            sim.add_pci_device(addr, VENDOR_AMD, 0x73BF, 0x03);
        }
        let mut dir = IommuDeviceDirectory::new();

        assert_eq!(
            dir.setup_device_groups(&sim, &PartitionConfig::default()),
            Err(Error::ResourceExhausted)
        );
        assert_eq!(dir.groups().len(), MAX_IOMMU_GROUPS);
    }

    #[test]
    fn test_init_enforced() {
        let mut sim = machine();
        let mut dir = IommuDeviceDirectory::new();
        assert_eq!(dir.init(&mut sim, &PartitionConfig::default()), IsolationMode::Enforced);
        assert_eq!(dir.groups().len(), 2);
    }

    #[test]
    fn test_init_without_controller_still_groups() {
        let mut sim = SimPlatform::new(2);
        sim.add_pci_device(AMD_GPU, VENDOR_AMD, 0x73BF, 0x03);
        let mut dir = IommuDeviceDirectory::new();

        assert_eq!(dir.init(&mut sim, &PartitionConfig::default()), IsolationMode::Degraded);
        assert_eq!(dir.owner_of(AMD_GPU), Some(CellId::Linux));
        assert_eq!(dir.status(), IommuStatus::NotDetected);
    }
}
