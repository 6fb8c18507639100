//! Architecture support
//!
//! Everything the control plane needs from the machine is expressed by the
//! [`Platform`] trait: CPUID, PCI configuration space, MMIO and control
//! registers, inter-processor freeze/thaw signalling, register context
//! capture and the bulk physical copy used by hibernation.
//!
//! The bare-metal implementation lives in [`x86_64`]; [`sim`] provides a
//! simulated machine for host-side testing.

use crate::iommu::pci::PciDeviceAddress;
use crate::Result;

pub mod mailbox;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", feature = "arch_x86_64"))] {
        pub mod x86_64;
        pub use self::x86_64::X86Platform;
    }
}

#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 32;

/// Output registers of a CPUID query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Control registers the hypervisor toggles feature bits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRegister {
    /// CR4
    Cr4,
    /// Extended control register 0
    Xcr0,
    /// Extended feature enable MSR
    Efer,
}

/// Inter-processor request sent to a core of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreSignal {
    /// Halt in the hypervisor and hand over register state
    Freeze = 1,
    /// Reload register state and return to the guest
    Thaw = 2,
}

impl CoreSignal {
    /// Get signal name as string
    pub fn as_str(self) -> &'static str {
        match self {
            CoreSignal::Freeze => "freeze",
            CoreSignal::Thaw => "thaw",
        }
    }
}

/// Register context of one core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
}

impl CpuContext {
    /// All-zero context
    pub const fn zeroed() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
        }
    }
}

/// Narrow hardware access capability used by every component
///
/// Reads take `&self`; anything that changes machine state takes `&mut self`.
/// The control plane owns exactly one platform value and passes it down by
/// reference, so there is no global hardware state.
pub trait Platform {
    /// Execute CPUID for `leaf`/`subleaf`
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Read a dword from PCI configuration space (offset is dword aligned)
    fn pci_config_read(&self, addr: PciDeviceAddress, offset: u16) -> u32;

    /// Write a dword to PCI configuration space
    fn pci_config_write(&mut self, addr: PciDeviceAddress, offset: u16, value: u32);

    /// Read a 32-bit MMIO register
    fn mmio_read32(&self, addr: u64) -> u32;

    /// Write a 32-bit MMIO register
    fn mmio_write32(&mut self, addr: u64, value: u32);

    /// Read a control register
    fn read_control(&self, reg: ControlRegister) -> u64;

    /// Write a control register
    fn write_control(&mut self, reg: ControlRegister, value: u64);

    /// Post `signal` to `core`; does not wait for the acknowledgment
    fn signal_core(&mut self, core: u32, signal: CoreSignal) -> Result<()>;

    /// Check whether `core` has acknowledged `signal`
    fn core_acknowledged(&self, core: u32, signal: CoreSignal) -> bool;

    /// Register context a frozen core handed over
    fn capture_context(&self, core: u32) -> CpuContext;

    /// Context a frozen core will reload when thawed
    fn restore_context(&mut self, core: u32, context: &CpuContext);

    /// Copy `len` bytes of physical memory from `src` to `dst`
    fn copy_physical(&mut self, dst: u64, src: u64, len: u64) -> Result<()>;

    /// Monotonic clock in microseconds
    fn monotonic_us(&self) -> u64;
}
