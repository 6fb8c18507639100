//! Cells
//!
//! A cell is one guest with its own cores, memory region and hibernation
//! store. Cells are created once at boot and only ever change through the
//! transitions of [`CellStateMachine`].

use core::convert::TryFrom;
use core::fmt;

use crate::arch::{CpuContext, MAX_CPUS};
use crate::config::CellLayout;
use crate::cpu::CoreRange;
use crate::{Error, Result};

pub mod barrier;
pub mod machine;

pub use barrier::FreezeBarrier;
pub use machine::CellStateMachine;

/// Cell identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CellId {
    Linux = 0,
    Windows = 1,
}

impl CellId {
    /// Both cells in index order
    pub const ALL: [CellId; 2] = [CellId::Linux, CellId::Windows];

    /// The other cell
    pub fn other(self) -> CellId {
        match self {
            CellId::Linux => CellId::Windows,
            CellId::Windows => CellId::Linux,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CellId::Linux => "linux",
            CellId::Windows => "windows",
        }
    }
}

impl TryFrom<u8> for CellId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CellId::Linux),
            1 => Ok(CellId::Windows),
            _ => Err(Error::Config("cell id out of range")),
        }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Initializing,
    Running,
    Hibernated,
    /// Terminal, needs external intervention
    Error,
}

impl CellState {
    /// Check whether the lifecycle allows moving to `next`
    pub fn can_enter(self, next: CellState) -> bool {
        use CellState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Hibernated)
                | (Running, Hibernated)
                | (Hibernated, Running)
                | (Initializing, Error)
                | (Running, Error)
                | (Hibernated, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CellState::Initializing => "initializing",
            CellState::Running => "running",
            CellState::Hibernated => "hibernated",
            CellState::Error => "error",
        }
    }
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reserved region holding a raw mirror of a hibernated cell's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HibernationStore {
    pub base: u64,
    pub capacity: u64,
}

/// Saved register context of one core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedContext {
    pub core: u32,
    pub context: CpuContext,
}

/// One guest partition
#[derive(Debug, Clone)]
pub struct Cell {
    id: CellId,
    state: CellState,
    cores: CoreRange,
    memory_base: u64,
    memory_size: u64,
    store: HibernationStore,
    contexts: heapless::Vec<SavedContext, MAX_CPUS>,
    blocks_used: u32,
}

impl Cell {
    /// Create a cell in the `Initializing` state
    pub fn new(id: CellId, cores: CoreRange, layout: &CellLayout) -> Self {
        Self {
            id,
            state: CellState::Initializing,
            cores,
            memory_base: layout.memory_base,
            memory_size: layout.memory_size,
            store: HibernationStore {
                base: layout.hibernation_base,
                capacity: layout.hibernation_size,
            },
            contexts: heapless::Vec::new(),
            blocks_used: 0,
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == CellState::Running
    }

    pub fn cores(&self) -> CoreRange {
        self.cores
    }

    pub fn memory_base(&self) -> u64 {
        self.memory_base
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Guests start executing at the base of their memory region
    pub fn entry_point(&self) -> u64 {
        self.memory_base
    }

    pub fn store(&self) -> &HibernationStore {
        &self.store
    }

    /// Blocks written by the last hibernation, 0 if never saved
    pub fn blocks_used(&self) -> u32 {
        self.blocks_used
    }

    /// True when a memory image has been saved
    pub fn has_image(&self) -> bool {
        self.blocks_used > 0
    }

    pub fn saved_contexts(&self) -> &[SavedContext] {
        &self.contexts
    }

    /// Saved context of `core`
    pub fn saved_context(&self, core: u32) -> Option<&CpuContext> {
        self.contexts
            .iter()
            .find(|saved| saved.core == core)
            .map(|saved| &saved.context)
    }

    pub(crate) fn set_state(&mut self, next: CellState) -> Result<()> {
        if !self.state.can_enter(next) {
            return Err(Error::InvalidState);
        }
        log::debug!("cell {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Enter the terminal error state from anywhere
    pub(crate) fn fail(&mut self) {
        if self.state != CellState::Error {
            log::error!("cell {}: {} -> error", self.id, self.state);
            self.state = CellState::Error;
        }
    }

    pub(crate) fn save_contexts(&mut self, contexts: heapless::Vec<SavedContext, MAX_CPUS>) {
        self.contexts = contexts;
    }

    pub(crate) fn set_blocks_used(&mut self, blocks: u32) {
        self.blocks_used = blocks;
    }
}
