//! Cell switching
//!
//! A switch hands the machine from the active cell to the other one:
//! hibernate the active cell first, and only once that has fully succeeded
//! resume the other. This ordering is what keeps two cells from ever running
//! at the same time. A switch cannot be cancelled; it either completes or
//! leaves the failing cell in `Error`.

use alloc::sync::Arc;

use crate::arch::Platform;
use crate::cell::{CellId, CellState, CellStateMachine};
use crate::iommu::{IommuStatus, IsolationMode};
use crate::{Error, Result};

pub mod status;

pub use status::{CellStatus, StatusBoard, StatusSnapshot};

/// Switch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchRecord {
    /// Completed switches
    pub count: u64,
    /// Monotonic time of the last completed switch
    pub last_switch_us: Option<u64>,
}

/// Drives handovers and publishes status
pub struct SwitchCoordinator {
    active: CellId,
    record: SwitchRecord,
    board: Arc<StatusBoard>,
    isolation: IsolationMode,
    iommu: IommuStatus,
}

impl SwitchCoordinator {
    /// Coordinator for booted `cells`, publishing the initial snapshot
    pub fn new(cells: &CellStateMachine, isolation: IsolationMode, iommu: IommuStatus) -> Self {
        let active = cells.running_cell().unwrap_or(CellId::Linux);
        let record = SwitchRecord::default();
        let board = Arc::new(StatusBoard::new(Self::build(active, &record, cells, isolation, iommu)));
        Self {
            active,
            record,
            board,
            isolation,
            iommu,
        }
    }

    pub fn active_cell(&self) -> CellId {
        self.active
    }

    pub fn record(&self) -> SwitchRecord {
        self.record
    }

    /// Shared handle for status readers
    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    /// Hand the machine to the other cell
    ///
    /// On a hibernate failure nothing is done to the other cell. On a resume
    /// failure the previous cell stays hibernated. Either way the active cell
    /// is unchanged.
    pub fn switch_cells<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        cells: &mut CellStateMachine,
    ) -> Result<CellId> {
        let current = self.active;
        let next = current.other();

        if cells.state(current) != CellState::Running || cells.state(next) != CellState::Hibernated
        {
            log::warn!(
                "switch refused: {} is {}, {} is {}",
                current,
                cells.state(current),
                next,
                cells.state(next)
            );
            return Err(Error::InvalidState);
        }
        if cells.cell(next).cores().is_empty() {
            return Err(Error::Config("target cell owns no cores"));
        }

        log::info!("switching {} -> {}", current, next);

        let hibernated = cells.hibernate(platform, current);
        self.publish(cells);
        if let Err(err) = hibernated {
            log::error!("switch aborted, {} not touched: {}", next, err);
            return Err(err);
        }

        let resumed = cells.resume(platform, next);
        if let Err(err) = resumed {
            self.publish(cells);
            log::error!("switch failed, no cell running: {}", err);
            return Err(err);
        }

        self.active = next;
        self.record.count += 1;
        self.record.last_switch_us = Some(platform.monotonic_us());
        self.publish(cells);

        log::info!("switch #{} complete, {} active", self.record.count, next);
        Ok(next)
    }

    /// Publish the current state to the board
    pub fn publish(&self, cells: &CellStateMachine) {
        self.board.publish(Self::build(
            self.active,
            &self.record,
            cells,
            self.isolation,
            self.iommu,
        ));
    }

    fn build(
        active: CellId,
        record: &SwitchRecord,
        cells: &CellStateMachine,
        isolation: IsolationMode,
        iommu: IommuStatus,
    ) -> StatusSnapshot {
        StatusSnapshot {
            active,
            cells: CellId::ALL.map(|id| {
                let cell = cells.cell(id);
                CellStatus {
                    state: cell.state(),
                    cores: cell.cores().len(),
                    blocks_used: cell.blocks_used(),
                }
            }),
            switch_count: record.count,
            last_switch_us: record.last_switch_us,
            isolation,
            iommu,
        }
    }
}
