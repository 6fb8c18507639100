//! Bare-metal x86_64 platform
//!
//! Port I/O for PCI configuration space, identity-mapped MMIO through
//! `volatile`, control registers through the `x86_64` crate, and the xAPIC
//! ICR to kick cores into their park path with an NMI.
//!
//! Core identifiers are initial APIC ids; the partition assumes the firmware
//! numbers them densely from 0.

use core::ptr::NonNull;

use ::x86_64::instructions::port::Port;
use ::x86_64::registers::control::Cr4;
use ::x86_64::registers::model_specific::Efer;
use ::x86_64::registers::xcontrol::XCr0;
use volatile::VolatilePtr;

use super::mailbox::CoreMailbox;
use super::{ControlRegister, CoreSignal, CpuContext, CpuidResult, Platform};
use crate::iommu::pci::{PciDeviceAddress, PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA};
use crate::{Error, Result};

/// Default xAPIC MMIO base
pub const XAPIC_BASE: u64 = 0xFEE0_0000;
/// Interrupt command register, low half
const APIC_ICR_LOW: u64 = 0x300;
/// Interrupt command register, high half (destination)
const APIC_ICR_HIGH: u64 = 0x310;
/// ICR delivery mode NMI
const APIC_DELIVERY_NMI: u32 = 0b100 << 8;
/// ICR delivery status (send pending)
const APIC_DELIVERY_PENDING: u32 = 1 << 12;

static MAILBOX: CoreMailbox = CoreMailbox::new();

/// Mailbox shared with the NMI park path
pub fn mailbox() -> &'static CoreMailbox {
    &MAILBOX
}

/// The physical x86_64 machine
pub struct X86Platform {
    /// TSC ticks per microsecond, calibrated by boot code
    tsc_per_us: u64,
    /// Local APIC MMIO base
    apic_base: u64,
}

impl X86Platform {
    /// Create the platform with a calibrated TSC rate
    pub const fn new(tsc_per_us: u64) -> Self {
        Self {
            tsc_per_us,
            apic_base: XAPIC_BASE,
        }
    }

    fn reg32(addr: u64) -> Option<VolatilePtr<'static, u32>> {
        let ptr = NonNull::new(addr as *mut u32)?;
        // SAFETY: physical memory is identity mapped and the callers only
        // pass device register addresses discovered at boot.
        Some(unsafe { VolatilePtr::new(ptr) })
    }

    fn send_nmi(&mut self, apic_id: u32) {
        self.mmio_write32(self.apic_base + APIC_ICR_HIGH, apic_id << 24);
        self.mmio_write32(self.apic_base + APIC_ICR_LOW, APIC_DELIVERY_NMI);
        while self.mmio_read32(self.apic_base + APIC_ICR_LOW) & APIC_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

impl Platform for X86Platform {
    #[allow(unused_unsafe)]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let raw = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuidResult {
            eax: raw.eax,
            ebx: raw.ebx,
            ecx: raw.ecx,
            edx: raw.edx,
        }
    }

    fn pci_config_read(&self, addr: PciDeviceAddress, offset: u16) -> u32 {
        let mut address = Port::<u32>::new(PCI_CONFIG_ADDRESS);
        let mut data = Port::<u32>::new(PCI_CONFIG_DATA);
        unsafe {
            address.write(addr.config_address(offset));
            data.read()
        }
    }

    fn pci_config_write(&mut self, addr: PciDeviceAddress, offset: u16, value: u32) {
        let mut address = Port::<u32>::new(PCI_CONFIG_ADDRESS);
        let mut data = Port::<u32>::new(PCI_CONFIG_DATA);
        unsafe {
            address.write(addr.config_address(offset));
            data.write(value);
        }
    }

    fn mmio_read32(&self, addr: u64) -> u32 {
        Self::reg32(addr).map(|reg| reg.read()).unwrap_or(u32::MAX)
    }

    fn mmio_write32(&mut self, addr: u64, value: u32) {
        if let Some(reg) = Self::reg32(addr) {
            reg.write(value);
        }
    }

    fn read_control(&self, reg: ControlRegister) -> u64 {
        match reg {
            ControlRegister::Cr4 => Cr4::read_raw(),
            ControlRegister::Xcr0 => XCr0::read_raw(),
            ControlRegister::Efer => Efer::read_raw(),
        }
    }

    fn write_control(&mut self, reg: ControlRegister, value: u64) {
        unsafe {
            match reg {
                ControlRegister::Cr4 => Cr4::write_raw(value),
                ControlRegister::Xcr0 => XCr0::write_raw(value),
                ControlRegister::Efer => Efer::write_raw(value),
            }
        }
    }

    fn signal_core(&mut self, core: u32, signal: CoreSignal) -> Result<()> {
        if !MAILBOX.post(core, signal) {
            return Err(Error::Config("core outside mailbox range"));
        }
        // A thaw only needs the request word; the parked core polls it
        if signal == CoreSignal::Freeze {
            self.send_nmi(core);
        }
        Ok(())
    }

    fn core_acknowledged(&self, core: u32, signal: CoreSignal) -> bool {
        MAILBOX.acknowledged(core, signal)
    }

    fn capture_context(&self, core: u32) -> CpuContext {
        MAILBOX.context(core)
    }

    fn restore_context(&mut self, core: u32, context: &CpuContext) {
        MAILBOX.set_context(core, context);
    }

    fn copy_physical(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| Error::CopyFailed)?;
        dst.checked_add(len as u64).ok_or(Error::CopyFailed)?;
        src.checked_add(len as u64).ok_or(Error::CopyFailed)?;
        if dst == 0 || src == 0 {
            return Err(Error::CopyFailed);
        }
        // SAFETY: both ranges are validated partition regions, identity mapped
        // and disjoint, and every core that could touch them is frozen.
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        }
        Ok(())
    }

    #[allow(unused_unsafe)]
    fn monotonic_us(&self) -> u64 {
        let tsc = unsafe { core::arch::x86_64::_rdtsc() };
        tsc / self.tsc_per_us.max(1)
    }
}
