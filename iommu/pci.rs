//! PCI configuration space access
//!
//! Device addressing, identity decoding and capability-list walking on top of
//! [`Platform::pci_config_read`].

use core::fmt;

use crate::arch::Platform;

/// PCI configuration address port
pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Vendor/device id dword
pub const PCI_VENDOR_ID: u16 = 0x00;
/// Status/command dword
pub const PCI_COMMAND_STATUS: u16 = 0x04;
/// Class code/revision dword
pub const PCI_CLASS_REVISION: u16 = 0x08;
/// BIST/header type/latency/cache line dword
pub const PCI_HEADER_DWORD: u16 = 0x0C;
/// Capabilities pointer
pub const PCI_CAPABILITIES_PTR: u16 = 0x34;

/// Status register: capability list present
const STATUS_CAP_LIST: u32 = 1 << (16 + 4);
/// Header type: multi-function device
const HEADER_MULTIFUNCTION: u32 = 0x80 << 16;

/// Display controller base class
pub const PCI_CLASS_DISPLAY: u8 = 0x03;
/// Bridge base class
pub const PCI_CLASS_BRIDGE: u8 = 0x06;

/// Vendor id of an empty slot
pub const PCI_VENDOR_NONE: u16 = 0xFFFF;

pub const MAX_BUSES: u16 = 256;
pub const MAX_DEVICES: u8 = 32;
pub const MAX_FUNCTIONS: u8 = 8;

/// Upper bound on capability list entries (256-byte space / 4-byte minimum)
const MAX_CAPABILITIES: usize = 48;

/// Bus/device/function address of a PCI device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciDeviceAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciDeviceAddress {
    /// Create a new address
    ///
    /// The caller keeps `device < 32` and `function < 8`.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Encode a CONFIG_ADDRESS value for `offset`
    pub const fn config_address(&self, offset: u16) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.device as u32 & 0x1F) << 11)
            | ((self.function as u32 & 0x07) << 8)
            | (offset as u32 & 0xFC)
    }
}

impl fmt::Display for PciDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Identity fields read from configuration space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor: u16,
    pub device: u16,
    /// Base class code
    pub class: u8,
}

impl DeviceIdentity {
    /// Check if this is a display (GPU) device
    pub fn is_display(&self) -> bool {
        self.class == PCI_CLASS_DISPLAY
    }
}

/// Read the identity of the device at `addr`, `None` for an empty slot
pub fn read_identity<P: Platform + ?Sized>(
    platform: &P,
    addr: PciDeviceAddress,
) -> Option<DeviceIdentity> {
    let ids = platform.pci_config_read(addr, PCI_VENDOR_ID);
    let vendor = (ids & 0xFFFF) as u16;
    if vendor == PCI_VENDOR_NONE || vendor == 0 {
        return None;
    }

    let class = platform.pci_config_read(addr, PCI_CLASS_REVISION);
    Some(DeviceIdentity {
        vendor,
        device: (ids >> 16) as u16,
        class: (class >> 24) as u8,
    })
}

/// Check whether function 0 at `addr` announces more functions
pub fn is_multifunction<P: Platform + ?Sized>(platform: &P, addr: PciDeviceAddress) -> bool {
    platform.pci_config_read(addr, PCI_HEADER_DWORD) & HEADER_MULTIFUNCTION != 0
}

/// Find the configuration-space offset of capability `id`
///
/// The walk is bounded so a malformed (looping) list cannot hang the scan.
pub fn find_capability<P: Platform + ?Sized>(
    platform: &P,
    addr: PciDeviceAddress,
    id: u8,
) -> Option<u8> {
    if platform.pci_config_read(addr, PCI_COMMAND_STATUS) & STATUS_CAP_LIST == 0 {
        return None;
    }

    let mut ptr = (platform.pci_config_read(addr, PCI_CAPABILITIES_PTR) & 0xFC) as u8;
    for _ in 0..MAX_CAPABILITIES {
        if ptr == 0 {
            return None;
        }
        let header = platform.pci_config_read(addr, ptr as u16);
        if (header & 0xFF) as u8 == id {
            return Some(ptr);
        }
        ptr = ((header >> 8) & 0xFC) as u8;
    }

    log::warn!("PCI {}: capability list does not terminate", addr);
    None
}

/// Visit every present function on every bus
pub fn for_each_device<P, F>(platform: &P, mut visit: F)
where
    P: Platform + ?Sized,
    F: FnMut(PciDeviceAddress, DeviceIdentity),
{
    for bus in 0..MAX_BUSES {
        for device in 0..MAX_DEVICES {
            let base = PciDeviceAddress::new(bus as u8, device, 0);
            let identity = match read_identity(platform, base) {
                Some(identity) => identity,
                None => continue,
            };
            visit(base, identity);

            if !is_multifunction(platform, base) {
                continue;
            }
            for function in 1..MAX_FUNCTIONS {
                let addr = PciDeviceAddress::new(bus as u8, device, function);
                if let Some(identity) = read_identity(platform, addr) {
                    visit(addr, identity);
                }
            }
        }
    }
}
