//! Cell lifecycle and the hibernate/resume primitives
//!
//! ```text
//! Initializing --boot--> Running <--resume-- Hibernated
//!      |                    |--hibernate-->     |
//!      +--------------------+------------------+--> Error (terminal)
//! ```
//!
//! Hibernation freezes every core of the cell, captures their register
//! context and mirrors the cell's memory into its store. Resume is the
//! inverse. A failure anywhere leaves the cell in `Error`; nothing is
//! retried, since a half-written image is not safe to reuse.

use crate::arch::{CoreSignal, CpuContext, Platform, MAX_CPUS};
use crate::config::PartitionConfig;
use crate::cpu::CpuTopology;
use crate::{Error, Result};

use super::{Cell, CellId, CellState, FreezeBarrier, SavedContext};

/// Owns both cells and drives their transitions
#[derive(Debug, Clone)]
pub struct CellStateMachine {
    cells: [Cell; 2],
    barrier: FreezeBarrier,
    block_size: u64,
}

impl CellStateMachine {
    /// Both cells start in `Initializing`
    pub fn new(config: &PartitionConfig, topology: &CpuTopology) -> Self {
        let cells = CellId::ALL.map(|id| Cell::new(id, topology.range(id), config.cell(id)));
        Self {
            cells,
            barrier: FreezeBarrier::new(config.freeze_timeout_us),
            block_size: config.hibernation_block_size,
        }
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id.index()]
    }

    pub fn state(&self, id: CellId) -> CellState {
        self.cell(id).state()
    }

    /// The cell currently running, if any
    pub fn running_cell(&self) -> Option<CellId> {
        CellId::ALL.into_iter().find(|id| self.cell(*id).is_running())
    }

    /// Apply the boot policy: Linux runs, Windows waits hibernated
    ///
    /// The standby cell's cores are frozen into their park loop so the first
    /// resume has parked cores to thaw. If they do not all park, the standby
    /// cell goes to `Error` and Linux keeps running alone.
    pub fn boot<P: Platform + ?Sized>(&mut self, platform: &mut P) -> Result<()> {
        if self.cells.iter().any(|cell| cell.state() != CellState::Initializing) {
            return Err(Error::InvalidState);
        }
        self.cell_mut(CellId::Linux).set_state(CellState::Running)?;

        let standby = CellId::Windows;
        let cores = self.cell(standby).cores();
        match self.barrier.rendezvous(platform, cores, CoreSignal::Freeze) {
            Ok(()) => {
                self.cell_mut(standby).set_state(CellState::Hibernated)?;
                log::info!("cells booted: linux running, windows parked on cores {}", cores);
            }
            Err(err) => {
                log::error!("parking {} cores failed: {}", standby, err);
                self.fail(standby);
            }
        }
        Ok(())
    }

    /// Move `id` to the terminal error state
    pub fn fail(&mut self, id: CellId) {
        self.cell_mut(id).fail();
    }

    /// Freeze `id` and save it into its hibernation store
    pub fn hibernate<P: Platform + ?Sized>(&mut self, platform: &mut P, id: CellId) -> Result<()> {
        if self.state(id) != CellState::Running {
            return Err(Error::InvalidState);
        }

        let result = self.save(platform, id);
        match result {
            Ok(blocks) => {
                let cell = self.cell_mut(id);
                cell.set_blocks_used(blocks);
                cell.set_state(CellState::Hibernated)?;
                log::info!("cell {} hibernated, {} blocks saved", id, blocks);
                Ok(())
            }
            Err(err) => {
                log::error!("hibernating cell {} failed: {}", id, err);
                self.fail(id);
                Err(err)
            }
        }
    }

    fn save<P: Platform + ?Sized>(&mut self, platform: &mut P, id: CellId) -> Result<u32> {
        let cores = self.cell(id).cores();
        self.barrier.rendezvous(platform, cores, CoreSignal::Freeze)?;

        // Every core is parked from here on
        let mut contexts = heapless::Vec::<SavedContext, MAX_CPUS>::new();
        for core in cores.iter() {
            let context = platform.capture_context(core);
            contexts
                .push(SavedContext { core, context })
                .map_err(|_| Error::ResourceExhausted)?;
        }
        self.cell_mut(id).save_contexts(contexts);

        let cell = self.cell(id);
        copy_image(
            platform,
            cell.store().base,
            cell.memory_base(),
            cell.memory_size(),
            self.block_size,
        )
    }

    /// Restore `id` from its hibernation store and let it run
    ///
    /// A cell that was never saved is cold-started at its entry point.
    /// Refused while the other cell is running.
    pub fn resume<P: Platform + ?Sized>(&mut self, platform: &mut P, id: CellId) -> Result<()> {
        if self.state(id) != CellState::Hibernated {
            return Err(Error::InvalidState);
        }
        if self.state(id.other()) == CellState::Running {
            log::warn!("refusing to resume {} while {} is running", id, id.other());
            return Err(Error::InvalidState);
        }
        if self.cell(id).cores().is_empty() {
            return Err(Error::Config("cell owns no cores"));
        }

        match self.restore(platform, id) {
            Ok(()) => {
                self.cell_mut(id).set_state(CellState::Running)?;
                log::info!("cell {} resumed", id);
                Ok(())
            }
            Err(err) => {
                log::error!("resuming cell {} failed: {}", id, err);
                self.fail(id);
                Err(err)
            }
        }
    }

    fn restore<P: Platform + ?Sized>(&self, platform: &mut P, id: CellId) -> Result<()> {
        let cell = self.cell(id);
        let cores = cell.cores();

        if cell.has_image() {
            copy_image(
                platform,
                cell.memory_base(),
                cell.store().base,
                cell.memory_size(),
                self.block_size,
            )?;
            for saved in cell.saved_contexts() {
                platform.restore_context(saved.core, &saved.context);
            }
        } else {
            log::info!("cell {}: no saved image, cold start at {:#x}", id, cell.entry_point());
            let entry = CpuContext {
                rip: cell.entry_point(),
                ..CpuContext::zeroed()
            };
            for core in cores.iter() {
                platform.restore_context(core, &entry);
            }
        }

        self.barrier.rendezvous(platform, cores, CoreSignal::Thaw)
    }
}

/// Copy `len` bytes from `src` to `dst` in `block`-sized chunks
///
/// Returns the number of blocks transferred.
fn copy_image<P: Platform + ?Sized>(
    platform: &mut P,
    dst: u64,
    src: u64,
    len: u64,
    block: u64,
) -> Result<u32> {
    let mut offset = 0;
    let mut blocks = 0u32;
    while offset < len {
        let chunk = block.min(len - offset);
        platform.copy_physical(dst + offset, src + offset, chunk)?;
        offset += chunk;
        blocks += 1;
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mailbox::CoreMailbox;
    use crate::arch::sim::{SimEvent, SimPlatform};
    use crate::arch::{ControlRegister, CpuidResult};
    use crate::cpu::TopologySource;
    use crate::iommu::PciDeviceAddress;
    use crate::utils::MIB;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn machine(cores: u32) -> (SimPlatform, CellStateMachine) {
        let config = PartitionConfig::small();
        config.validate().unwrap();
        let topology = CpuTopology::partition(cores, TopologySource::ExtendedTopology, None);
        let mut sim = SimPlatform::new(cores);
        let mut cells = CellStateMachine::new(&config, &topology);
        cells.boot(&mut sim).unwrap();
        sim.clear_events();
        (sim, cells)
    }

    #[test]
    fn test_boot_policy() {
        let (_, cells) = machine(4);
        assert_eq!(cells.state(CellId::Linux), CellState::Running);
        assert_eq!(cells.state(CellId::Windows), CellState::Hibernated);
        assert_eq!(cells.running_cell(), Some(CellId::Linux));
    }

    #[test]
    fn test_boot_twice_rejected() {
        let (mut sim, mut cells) = machine(4);
        assert_eq!(cells.boot(&mut sim), Err(Error::InvalidState));
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_boot_parks_standby_cores() {
        let mut sim = SimPlatform::new(4);
        let topology = CpuTopology::partition(4, TopologySource::ExtendedTopology, None);
        let mut cells = CellStateMachine::new(&PartitionConfig::small(), &topology);
        cells.boot(&mut sim).unwrap();

        assert!(!sim.is_parked(0) && !sim.is_parked(1));
        assert!(sim.is_parked(2) && sim.is_parked(3));
        let signalled: Vec<u32> = sim
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Signal { core, signal: CoreSignal::Freeze } => Some(core),
                _ => None,
            })
            .collect();
        assert_eq!(signalled, vec![2, 3]);
    }

    #[test]
    fn test_boot_with_unparkable_standby_core() {
        let mut sim = SimPlatform::new(4);
        sim.make_unresponsive(3);
        let topology = CpuTopology::partition(4, TopologySource::ExtendedTopology, None);
        let mut cells = CellStateMachine::new(&PartitionConfig::small(), &topology);

        assert_eq!(cells.boot(&mut sim), Ok(()));
        assert_eq!(cells.state(CellId::Linux), CellState::Running);
        assert_eq!(cells.state(CellId::Windows), CellState::Error);
    }

    #[test]
    fn test_copy_starts_after_every_freeze_ack() {
        let (mut sim, mut cells) = machine(12);
        cells.hibernate(&mut sim, CellId::Linux).unwrap();

        let events = sim.events();
        let last_ack = events
            .iter()
            .rposition(|e| matches!(e, SimEvent::Ack { signal: CoreSignal::Freeze, .. }))
            .unwrap();
        let first_copy = events
            .iter()
            .position(|e| matches!(e, SimEvent::Copy { .. }))
            .unwrap();
        let acked = events
            .iter()
            .filter(|e| matches!(e, SimEvent::Ack { signal: CoreSignal::Freeze, .. }))
            .count();

        assert_eq!(acked, 6);
        assert!(last_ack < first_copy);
        assert_eq!(cells.cell(CellId::Linux).blocks_used(), 4);
        assert_eq!(cells.state(CellId::Linux), CellState::Hibernated);
    }

    #[test]
    fn test_copies_stay_within_cell_and_store() {
        let (mut sim, mut cells) = machine(4);
        cells.hibernate(&mut sim, CellId::Linux).unwrap();

        for event in sim.events() {
            if let SimEvent::Copy { dst, src, len } = event {
                assert!(src >= 64 * MIB && src + len <= 72 * MIB);
                assert!(dst >= 128 * MIB && dst + len <= 136 * MIB);
                assert_eq!(len, 2 * MIB);
            }
        }
    }

    #[test]
    fn test_memory_and_context_round_trip() {
        let (mut sim, mut cells) = machine(4);
        sim.poke(64 * MIB + 0x10, b"linux");
        sim.poke(72 * MIB - 3, b"end");
        sim.set_live_context(1, CpuContext { rip: 0x1234, rsp: 0x8000, ..CpuContext::zeroed() });

        cells.hibernate(&mut sim, CellId::Linux).unwrap();
        assert_eq!(sim.peek(128 * MIB + 0x10, 5), b"linux");
        assert_eq!(cells.cell(CellId::Linux).saved_context(1).unwrap().rip, 0x1234);

        // Scribble over the live state while hibernated
        sim.poke(64 * MIB + 0x10, b"XXXXX");
        sim.set_live_context(1, CpuContext::zeroed());

        cells.resume(&mut sim, CellId::Linux).unwrap();
        assert_eq!(sim.peek(64 * MIB + 0x10, 5), b"linux");
        assert_eq!(sim.peek(72 * MIB - 3, 3), b"end");
        assert_eq!(sim.live_context(1).rip, 0x1234);
        assert_eq!(sim.live_context(1).rsp, 0x8000);
    }

    #[test]
    fn test_cold_start_resume() {
        let (mut sim, mut cells) = machine(4);
        cells.hibernate(&mut sim, CellId::Linux).unwrap();
        sim.clear_events();

        cells.resume(&mut sim, CellId::Windows).unwrap();

        assert!(!sim.events().iter().any(|e| matches!(e, SimEvent::Copy { .. })));
        assert_eq!(sim.live_context(2).rip, 72 * MIB);
        assert_eq!(sim.live_context(3).rip, 72 * MIB);
        assert!(!sim.is_parked(2) && !sim.is_parked(3));
        assert_eq!(cells.state(CellId::Windows), CellState::Running);
        assert_eq!(cells.running_cell(), Some(CellId::Windows));
    }

    #[test]
    fn test_resume_refused_while_other_running() {
        let (mut sim, mut cells) = machine(4);

        assert_eq!(cells.resume(&mut sim, CellId::Windows), Err(Error::InvalidState));
        assert_eq!(cells.state(CellId::Linux), CellState::Running);
        assert_eq!(cells.state(CellId::Windows), CellState::Hibernated);
        assert!(sim.events().is_empty());
        assert!(sim.is_parked(2));
    }

    #[test]
    fn test_freeze_timeout_fails_cell_without_copy() {
        let (mut sim, mut cells) = machine(4);
        sim.make_unresponsive(1);

        assert_eq!(
            cells.hibernate(&mut sim, CellId::Linux),
            Err(Error::SyncTimeout { core: 1 })
        );
        assert_eq!(cells.state(CellId::Linux), CellState::Error);
        assert!(!sim.events().iter().any(|e| matches!(e, SimEvent::Copy { .. })));
    }

    #[test]
    fn test_copy_fault_fails_cell() {
        let (mut sim, mut cells) = machine(4);
        sim.fail_copies_after(2);

        assert_eq!(cells.hibernate(&mut sim, CellId::Linux), Err(Error::CopyFailed));
        assert_eq!(cells.state(CellId::Linux), CellState::Error);
    }

    #[test]
    fn test_wrong_state_calls_do_not_mutate() {
        let (mut sim, mut cells) = machine(4);

        assert_eq!(cells.hibernate(&mut sim, CellId::Windows), Err(Error::InvalidState));
        assert_eq!(cells.resume(&mut sim, CellId::Linux), Err(Error::InvalidState));
        assert_eq!(cells.state(CellId::Linux), CellState::Running);
        assert_eq!(cells.state(CellId::Windows), CellState::Hibernated);
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_resume_without_cores() {
        let (mut sim, mut cells) = machine(1);
        cells.hibernate(&mut sim, CellId::Linux).unwrap();
        assert!(matches!(
            cells.resume(&mut sim, CellId::Windows),
            Err(Error::Config(_))
        ));
        assert_eq!(cells.state(CellId::Windows), CellState::Hibernated);
    }

    #[test]
    fn test_error_is_terminal() {
        let (mut sim, mut cells) = machine(4);
        cells.fail(CellId::Linux);
        assert_eq!(cells.hibernate(&mut sim, CellId::Linux), Err(Error::InvalidState));
        assert_eq!(cells.running_cell(), None);
    }

    /// Sim machine whose cores are threads parked through a real mailbox
    struct ThreadedCores {
        sim: SimPlatform,
        mailbox: Arc<CoreMailbox>,
        started: Instant,
    }

    impl Platform for ThreadedCores {
        fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
            self.sim.cpuid(leaf, subleaf)
        }
        fn pci_config_read(&self, addr: PciDeviceAddress, offset: u16) -> u32 {
            self.sim.pci_config_read(addr, offset)
        }
        fn pci_config_write(&mut self, addr: PciDeviceAddress, offset: u16, value: u32) {
            self.sim.pci_config_write(addr, offset, value)
        }
        fn mmio_read32(&self, addr: u64) -> u32 {
            self.sim.mmio_read32(addr)
        }
        fn mmio_write32(&mut self, addr: u64, value: u32) {
            self.sim.mmio_write32(addr, value)
        }
        fn read_control(&self, reg: ControlRegister) -> u64 {
            self.sim.read_control(reg)
        }
        fn write_control(&mut self, reg: ControlRegister, value: u64) {
            self.sim.write_control(reg, value)
        }
        fn signal_core(&mut self, core: u32, signal: CoreSignal) -> Result<()> {
            if !self.mailbox.post(core, signal) {
                return Err(Error::Config("core outside mailbox range"));
            }
            Ok(())
        }
        fn core_acknowledged(&self, core: u32, signal: CoreSignal) -> bool {
            self.mailbox.acknowledged(core, signal)
        }
        fn capture_context(&self, core: u32) -> CpuContext {
            self.mailbox.context(core)
        }
        fn restore_context(&mut self, core: u32, context: &CpuContext) {
            self.mailbox.set_context(core, context)
        }
        fn copy_physical(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
            self.sim.copy_physical(dst, src, len)
        }
        fn monotonic_us(&self) -> u64 {
            self.started.elapsed().as_micros() as u64
        }
    }

    #[test]
    fn test_switch_cycle_over_mailbox() {
        let mailbox = Arc::new(CoreMailbox::new());
        let stop = Arc::new(AtomicBool::new(false));

        // Each core runs its guest loop and parks whenever a freeze is posted
        let cores: Vec<_> = (0..4u32)
            .map(|core| {
                let mailbox = Arc::clone(&mailbox);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut frame = CpuContext {
                        rip: 0x1000 + u64::from(core),
                        ..CpuContext::zeroed()
                    };
                    while !stop.load(Ordering::Acquire) {
                        if mailbox.freeze_requested(core) {
                            mailbox.park(core, &mut frame);
                        }
                        thread::yield_now();
                    }
                    frame
                })
            })
            .collect();

        let mut platform = ThreadedCores {
            sim: SimPlatform::new(4),
            mailbox: Arc::clone(&mailbox),
            started: Instant::now(),
        };
        let mut config = PartitionConfig::small();
        config.freeze_timeout_us = 5_000_000;
        let topology = CpuTopology::partition(4, TopologySource::ExtendedTopology, None);
        let mut cells = CellStateMachine::new(&config, &topology);

        cells.boot(&mut platform).unwrap();
        assert_eq!(cells.state(CellId::Windows), CellState::Hibernated);

        cells.hibernate(&mut platform, CellId::Linux).unwrap();
        assert_eq!(cells.cell(CellId::Linux).saved_context(1).unwrap().rip, 0x1001);
        cells.resume(&mut platform, CellId::Windows).unwrap();

        cells.hibernate(&mut platform, CellId::Windows).unwrap();
        assert_eq!(cells.cell(CellId::Windows).saved_context(2).unwrap().rip, 72 * MIB);
        cells.resume(&mut platform, CellId::Linux).unwrap();
        assert_eq!(cells.running_cell(), Some(CellId::Linux));

        // Release the parked standby cores so every thread can exit
        for core in 2..4 {
            assert!(mailbox.post(core, CoreSignal::Thaw));
            while !mailbox.acknowledged(core, CoreSignal::Thaw) {
                thread::yield_now();
            }
        }
        stop.store(true, Ordering::Release);

        let frames: Vec<CpuContext> = cores.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(frames[0].rip, 0x1000);
        assert_eq!(frames[1].rip, 0x1001);
        assert_eq!(frames[2].rip, 72 * MIB);
        assert_eq!(frames[3].rip, 72 * MIB);
    }
}
