//! Published status
//!
//! The control thread is the only writer. Readers on other cores (dashboard,
//! monitor) take a whole-snapshot copy under the board's lock, so they never
//! see a half-updated switch.

use core::fmt;

use crate::cell::{CellId, CellState};
use crate::iommu::{IommuStatus, IsolationMode};
use crate::sync::SpinLock;

/// Per-cell part of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellStatus {
    pub state: CellState,
    /// Cores owned by the cell
    pub cores: u32,
    /// Blocks written by the last hibernation
    pub blocks_used: u32,
}

/// Consistent view of the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub active: CellId,
    pub cells: [CellStatus; 2],
    pub switch_count: u64,
    /// Monotonic time of the last completed switch
    pub last_switch_us: Option<u64>,
    pub isolation: IsolationMode,
    pub iommu: IommuStatus,
}

impl StatusSnapshot {
    pub fn cell(&self, id: CellId) -> &CellStatus {
        &self.cells[id.index()]
    }

    /// Number of cells in the `Running` state
    pub fn running_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| cell.state == CellState::Running)
            .count()
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "active cell: {}", self.active)?;
        for id in CellId::ALL {
            let cell = self.cell(id);
            writeln!(
                f,
                "  {:<8} {:<12} {:>2} cores  {:>6} blocks",
                id.as_str(),
                cell.state.as_str(),
                cell.cores,
                cell.blocks_used
            )?;
        }
        match self.last_switch_us {
            Some(at) => writeln!(f, "switches: {} (last at {} us)", self.switch_count, at)?,
            None => writeln!(f, "switches: {}", self.switch_count)?,
        }
        write!(f, "IOMMU: {} ({:?})", self.iommu, self.isolation)
    }
}

/// Lock-protected latest snapshot
pub struct StatusBoard {
    current: SpinLock<StatusSnapshot>,
}

impl StatusBoard {
    pub fn new(initial: StatusSnapshot) -> Self {
        Self {
            current: SpinLock::new(initial),
        }
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        *self.current.lock()
    }

    /// Replace the snapshot
    pub fn publish(&self, snapshot: StatusSnapshot) {
        *self.current.lock() = snapshot;
    }
}
