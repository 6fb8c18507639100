//! CPU feature enablement
//!
//! Best-effort toggles for the execution features guests expect to find
//! already switched on: SSE state saving, AVX through XSAVE, and no-execute
//! page protection. A missing feature or a control write that does not stick
//! is logged and skipped; none of this can fail boot.

use bitflags::bitflags;

use crate::arch::{ControlRegister, Platform};
use crate::{Capability, Error};

/// CPUID leaf 1 EDX: SSE
pub(crate) const CPUID_1_EDX_SSE: u32 = 1 << 25;
/// CPUID leaf 1 ECX: XSAVE
pub(crate) const CPUID_1_ECX_XSAVE: u32 = 1 << 26;
/// CPUID leaf 1 ECX: AVX
pub(crate) const CPUID_1_ECX_AVX: u32 = 1 << 28;
/// CPUID leaf 0x8000_0001 EDX: NX
pub(crate) const CPUID_EXT_EDX_NX: u32 = 1 << 20;

/// CR4: OS supports FXSAVE/FXRSTOR
const CR4_OSFXSR: u64 = 1 << 9;
/// CR4: OS supports XSAVE
const CR4_OSXSAVE: u64 = 1 << 18;
/// XCR0: x87, SSE and AVX state components
const XCR0_X87_SSE_AVX: u64 = 0b111;
/// EFER: no-execute enable
const EFER_NXE: u64 = 1 << 11;

bitflags! {
    /// Execution features the hypervisor switches on for its cells
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        /// SSE state saving (CR4.OSFXSR)
        const SSE = 1 << 0;
        /// AVX state through XSAVE (CR4.OSXSAVE, XCR0)
        const AVX = 1 << 1;
        /// No-execute pages (EFER.NXE)
        const NX = 1 << 2;
    }
}

/// Features the processor reports through CPUID
pub fn supported<P: Platform + ?Sized>(platform: &P) -> CpuFeatures {
    let mut features = CpuFeatures::empty();

    let leaf1 = platform.cpuid(1, 0);
    if leaf1.edx & CPUID_1_EDX_SSE != 0 {
        features |= CpuFeatures::SSE;
    }
    if leaf1.ecx & CPUID_1_ECX_AVX != 0 && leaf1.ecx & CPUID_1_ECX_XSAVE != 0 {
        features |= CpuFeatures::AVX;
    }

    if platform.cpuid(0x8000_0000, 0).eax >= 0x8000_0001
        && platform.cpuid(0x8000_0001, 0).edx & CPUID_EXT_EDX_NX != 0
    {
        features |= CpuFeatures::NX;
    }

    features
}

/// Set `bits` in `reg` and check that they read back
fn set_bits<P: Platform + ?Sized>(platform: &mut P, reg: ControlRegister, bits: u64) -> bool {
    let value = platform.read_control(reg) | bits;
    platform.write_control(reg, value);
    platform.read_control(reg) & bits == bits
}

fn unavailable(capability: Capability) {
    log::warn!("{}", Error::HardwareUnavailable(capability));
}

/// Enable every supported feature, returning the ones that took effect
pub fn enable_features<P: Platform + ?Sized>(platform: &mut P) -> CpuFeatures {
    let supported = supported(platform);
    let mut enabled = CpuFeatures::empty();

    if !supported.contains(CpuFeatures::SSE) {
        unavailable(Capability::Sse);
    } else if set_bits(platform, ControlRegister::Cr4, CR4_OSFXSR) {
        enabled |= CpuFeatures::SSE;
    } else {
        log::warn!("CR4.OSFXSR did not latch");
        unavailable(Capability::Sse);
    }

    // XCR0 is only writable once CR4.OSXSAVE is set
    if !supported.contains(CpuFeatures::AVX) {
        unavailable(Capability::Avx);
    } else if set_bits(platform, ControlRegister::Cr4, CR4_OSXSAVE)
        && set_bits(platform, ControlRegister::Xcr0, XCR0_X87_SSE_AVX)
    {
        enabled |= CpuFeatures::AVX;
    } else {
        log::warn!("XSAVE state enable did not latch");
        unavailable(Capability::Avx);
    }

    if !supported.contains(CpuFeatures::NX) {
        unavailable(Capability::NoExecute);
    } else if set_bits(platform, ControlRegister::Efer, EFER_NXE) {
        enabled |= CpuFeatures::NX;
    } else {
        log::warn!("EFER.NXE did not latch");
        unavailable(Capability::NoExecute);
    }

    log::info!("CPU features enabled: {:?}", enabled);
    enabled
}
