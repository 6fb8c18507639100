//! Simulated platform
//!
//! A deterministic, in-memory machine for host-side testing: programmable
//! CPUID leaves, a sparse PCI configuration space, MMIO and control
//! registers with optionally stuck bits, cores that follow the mailbox park
//! protocol (or ignore every request), sparse physical memory and a clock that advances on
//! every read. Every signal, acknowledgment and copy is recorded so tests can
//! check ordering.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use super::{ControlRegister, CoreSignal, CpuContext, CpuidResult, Platform};
use crate::cpu::features::{
    CPUID_1_ECX_AVX, CPUID_1_ECX_XSAVE, CPUID_1_EDX_SSE, CPUID_EXT_EDX_NX,
};
use crate::iommu::pci::{
    PciDeviceAddress, PCI_CAPABILITIES_PTR, PCI_CLASS_BRIDGE, PCI_CLASS_REVISION,
    PCI_COMMAND_STATUS, PCI_HEADER_DWORD, PCI_VENDOR_ID,
};
use crate::{Error, Result};

/// Microseconds the clock advances per read
const TICK_US: u64 = 10;

/// First offset used for synthesized capabilities
const FIRST_CAPABILITY: u16 = 0x40;

/// Something observable the simulated machine did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// Control core posted a signal
    Signal { core: u32, signal: CoreSignal },
    /// A core acknowledged a signal (recorded once per request)
    Ack { core: u32, signal: CoreSignal },
    /// Bulk copy
    Copy { dst: u64, src: u64, len: u64 },
}

/// Configuration space of one simulated function
#[derive(Debug, Clone)]
struct SimFunction {
    config: [u32; 64],
    next_capability: u16,
    last_capability: Option<u16>,
}

impl SimFunction {
    fn new() -> Self {
        Self {
            config: [0; 64],
            next_capability: FIRST_CAPABILITY,
            last_capability: None,
        }
    }
}

/// In-memory machine implementing [`Platform`]
#[derive(Debug)]
pub struct SimPlatform {
    cpuid: BTreeMap<(u32, u32), CpuidResult>,
    pci: BTreeMap<PciDeviceAddress, SimFunction>,
    mmio: BTreeMap<u64, u32>,
    stuck_mmio: BTreeMap<u64, u32>,
    control: [u64; 3],
    stuck_control: [u64; 3],
    unresponsive: BTreeSet<u32>,
    pending: RefCell<BTreeMap<u32, (CoreSignal, bool)>>,
    parked: RefCell<BTreeSet<u32>>,
    contexts: BTreeMap<u32, CpuContext>,
    memory: BTreeMap<u64, u8>,
    copies_before_fault: Option<usize>,
    clock_us: Cell<u64>,
    events: RefCell<Vec<SimEvent>>,
}

impl SimPlatform {
    /// A machine with `cores` cores reported through extended topology,
    /// SSE, AVX and NX available, and nothing on the PCI bus
    pub fn new(cores: u32) -> Self {
        let mut sim = Self {
            cpuid: BTreeMap::new(),
            pci: BTreeMap::new(),
            mmio: BTreeMap::new(),
            stuck_mmio: BTreeMap::new(),
            control: [0; 3],
            stuck_control: [0; 3],
            unresponsive: BTreeSet::new(),
            pending: RefCell::new(BTreeMap::new()),
            parked: RefCell::new(BTreeSet::new()),
            contexts: BTreeMap::new(),
            memory: BTreeMap::new(),
            copies_before_fault: None,
            clock_us: Cell::new(0),
            events: RefCell::new(Vec::new()),
        };

        sim.set_cpuid(0, 0, CpuidResult { eax: 0x0B, ..Default::default() });
        sim.set_cpuid(
            1,
            0,
            CpuidResult {
                eax: 0,
                ebx: cores.min(0xFF) << 16,
                ecx: CPUID_1_ECX_XSAVE | CPUID_1_ECX_AVX,
                edx: CPUID_1_EDX_SSE,
            },
        );
        // SMT level, core level, terminator
        sim.set_cpuid(0x0B, 0, CpuidResult { ebx: 2, ecx: 1 << 8, ..Default::default() });
        sim.set_cpuid(0x0B, 1, CpuidResult { ebx: cores, ecx: (2 << 8) | 1, ..Default::default() });
        sim.set_cpuid(0x0B, 2, CpuidResult { ecx: 2, ..Default::default() });
        sim.set_cpuid(0x8000_0000, 0, CpuidResult { eax: 0x8000_0001, ..Default::default() });
        sim.set_cpuid(0x8000_0001, 0, CpuidResult { edx: CPUID_EXT_EDX_NX, ..Default::default() });
        sim
    }

    /// A machine without CPUID leaf 0x0B; leaf 1 reports `cores`
    pub fn with_legacy_topology(cores: u32) -> Self {
        let mut sim = Self::new(cores);
        sim.set_cpuid(0, 0, CpuidResult { eax: 0x01, ..Default::default() });
        sim.cpuid.remove(&(0x0B, 0));
        sim.cpuid.remove(&(0x0B, 1));
        sim.cpuid.remove(&(0x0B, 2));
        sim
    }

    /// Program a CPUID result
    pub fn set_cpuid(&mut self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.cpuid.insert((leaf, subleaf), result);
    }

    /// Mutate a CPUID result in place
    pub fn update_cpuid(&mut self, leaf: u32, subleaf: u32, f: impl FnOnce(&mut CpuidResult)) {
        f(self.cpuid.entry((leaf, subleaf)).or_default());
    }

    /// Plug in a function with the given identity
    pub fn add_pci_device(&mut self, addr: PciDeviceAddress, vendor: u16, device: u16, class: u8) {
        let mut function = SimFunction::new();
        function.config[(PCI_VENDOR_ID / 4) as usize] = ((device as u32) << 16) | vendor as u32;
        function.config[(PCI_CLASS_REVISION / 4) as usize] = (class as u32) << 24;
        self.pci.insert(addr, function);
    }

    /// Mark function 0 at `addr` as multi-function
    pub fn set_multifunction(&mut self, addr: PciDeviceAddress) {
        if let Some(function) = self.pci.get_mut(&addr) {
            function.config[(PCI_HEADER_DWORD / 4) as usize] |= 0x80 << 16;
        }
    }

    /// Append a capability with `payload` dwords after its header
    pub fn add_capability(&mut self, addr: PciDeviceAddress, id: u8, payload: &[u32]) {
        let function = match self.pci.get_mut(&addr) {
            Some(function) => function,
            None => return,
        };

        let offset = function.next_capability;
        function.config[(offset / 4) as usize] = id as u32;
        for (i, dword) in payload.iter().enumerate() {
            function.config[(offset / 4) as usize + 1 + i] = *dword;
        }

        match function.last_capability {
            Some(prev) => function.config[(prev / 4) as usize] |= (offset as u32) << 8,
            None => {
                function.config[(PCI_CAPABILITIES_PTR / 4) as usize] = offset as u32;
                function.config[(PCI_COMMAND_STATUS / 4) as usize] |= 1 << 20;
            }
        }
        function.last_capability = Some(offset);
        function.next_capability = offset + 4 * (1 + payload.len() as u16);
    }

    /// Plug in an AMD-Vi translation controller with its MMIO window at `base`
    ///
    /// A host bridge is put at function 0 when `addr` is another function.
    pub fn add_amd_iommu(&mut self, addr: PciDeviceAddress, base: u64) {
        if addr.function != 0 {
            self.add_host_bridge(PciDeviceAddress::new(addr.bus, addr.device, 0));
        }
        self.add_pci_device(addr, 0x1022, 0x1451, 0x08);
        self.add_capability(addr, 0x05, &[0, 0]);
        self.add_capability(addr, 0x0F, &[(base as u32) | 0x1, (base >> 32) as u32]);
    }

    /// Plug in a multi-function AMD host bridge
    pub fn add_host_bridge(&mut self, addr: PciDeviceAddress) {
        if !self.pci.contains_key(&addr) {
            self.add_pci_device(addr, 0x1022, 0x1480, PCI_CLASS_BRIDGE);
        }
        self.set_multifunction(addr);
    }

    /// Preset an MMIO register value
    pub fn set_mmio(&mut self, addr: u64, value: u32) {
        self.mmio.insert(addr, value);
    }

    /// Bits of an MMIO register that never latch when written
    pub fn stick_mmio_bits(&mut self, addr: u64, mask: u32) {
        self.stuck_mmio.insert(addr, mask);
    }

    /// Bits of a control register that never latch when written
    pub fn stick_control_bits(&mut self, reg: ControlRegister, mask: u64) {
        self.stuck_control[reg as usize] = mask;
    }

    /// Make `core` ignore every freeze/thaw request
    pub fn make_unresponsive(&mut self, core: u32) {
        self.unresponsive.insert(core);
    }

    /// Make `core` acknowledge requests again
    pub fn make_responsive(&mut self, core: u32) {
        self.unresponsive.remove(&core);
    }

    /// Check whether `core` sits in its park loop
    pub fn is_parked(&self, core: u32) -> bool {
        self.parked.borrow().contains(&core)
    }

    /// Set the register context `core` is running with
    pub fn set_live_context(&mut self, core: u32, context: CpuContext) {
        self.contexts.insert(core, context);
    }

    /// Context `core` will run with after thaw
    pub fn live_context(&self, core: u32) -> CpuContext {
        self.contexts.get(&core).copied().unwrap_or_default()
    }

    /// Write bytes into simulated physical memory
    pub fn poke(&mut self, addr: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *byte);
        }
    }

    /// Read bytes from simulated physical memory (unwritten bytes read 0)
    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.memory.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    /// Let `count` copies succeed, then fail every later one
    pub fn fail_copies_after(&mut self, count: usize) {
        self.copies_before_fault = Some(count);
    }

    /// Everything observed so far
    pub fn events(&self) -> Vec<SimEvent> {
        self.events.borrow().clone()
    }

    /// Forget recorded events
    pub fn clear_events(&mut self) {
        self.events.borrow_mut().clear();
    }

    fn record(&self, event: SimEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl Platform for SimPlatform {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid.get(&(leaf, subleaf)).copied().unwrap_or_default()
    }

    fn pci_config_read(&self, addr: PciDeviceAddress, offset: u16) -> u32 {
        self.pci
            .get(&addr)
            .and_then(|function| function.config.get((offset / 4) as usize).copied())
            .unwrap_or(u32::MAX)
    }

    fn pci_config_write(&mut self, addr: PciDeviceAddress, offset: u16, value: u32) {
        if let Some(slot) = self
            .pci
            .get_mut(&addr)
            .and_then(|function| function.config.get_mut((offset / 4) as usize))
        {
            *slot = value;
        }
    }

    fn mmio_read32(&self, addr: u64) -> u32 {
        self.mmio.get(&addr).copied().unwrap_or(0)
    }

    fn mmio_write32(&mut self, addr: u64, value: u32) {
        let stuck = self.stuck_mmio.get(&addr).copied().unwrap_or(0);
        let old = self.mmio.get(&addr).copied().unwrap_or(0);
        self.mmio.insert(addr, (value & !stuck) | (old & stuck));
    }

    fn read_control(&self, reg: ControlRegister) -> u64 {
        self.control[reg as usize]
    }

    fn write_control(&mut self, reg: ControlRegister, value: u64) {
        let stuck = self.stuck_control[reg as usize];
        let old = self.control[reg as usize];
        self.control[reg as usize] = (value & !stuck) | (old & stuck);
    }

    fn signal_core(&mut self, core: u32, signal: CoreSignal) -> Result<()> {
        if core as usize >= super::MAX_CPUS {
            return Err(Error::Config("core outside mailbox range"));
        }
        self.pending.borrow_mut().insert(core, (signal, false));
        self.record(SimEvent::Signal { core, signal });
        Ok(())
    }

    fn core_acknowledged(&self, core: u32, signal: CoreSignal) -> bool {
        if self.unresponsive.contains(&core) {
            return false;
        }

        let mut pending = self.pending.borrow_mut();
        let seen = match pending.get_mut(&core) {
            Some((posted, seen)) if *posted == signal => seen,
            _ => return false,
        };
        if *seen {
            return true;
        }

        // A running core parks on freeze; only a parked core sees a thaw
        let mut parked = self.parked.borrow_mut();
        let answered = match signal {
            CoreSignal::Freeze => parked.insert(core),
            CoreSignal::Thaw => parked.remove(&core),
        };
        if answered {
            *seen = true;
            self.record(SimEvent::Ack { core, signal });
        }
        answered
    }

    fn capture_context(&self, core: u32) -> CpuContext {
        self.live_context(core)
    }

    fn restore_context(&mut self, core: u32, context: &CpuContext) {
        self.contexts.insert(core, *context);
    }

    fn copy_physical(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
        if let Some(remaining) = self.copies_before_fault.as_mut() {
            if *remaining == 0 {
                return Err(Error::CopyFailed);
            }
            *remaining -= 1;
        }
        let src_end = src.checked_add(len).ok_or(Error::CopyFailed)?;
        let dst_end = dst.checked_add(len).ok_or(Error::CopyFailed)?;

        let bytes: Vec<(u64, u8)> = self
            .memory
            .range(src..src_end)
            .map(|(addr, byte)| (addr - src, *byte))
            .collect();
        let stale: Vec<u64> = self.memory.range(dst..dst_end).map(|(addr, _)| *addr).collect();
        for addr in stale {
            self.memory.remove(&addr);
        }
        for (offset, byte) in bytes {
            self.memory.insert(dst + offset, byte);
        }

        self.record(SimEvent::Copy { dst, src, len });
        Ok(())
    }

    fn monotonic_us(&self) -> u64 {
        let now = self.clock_us.get() + TICK_US;
        self.clock_us.set(now);
        now
    }
}
