//! CPU topology and partitioning
//!
//! Detects how many cores the machine has and splits them into two
//! contiguous ranges, one per cell. Core identifiers are initial APIC ids,
//! which firmware numbers contiguously from 0 on the supported platforms.

use core::fmt;
use core::ops::Range;

use crate::arch::{Platform, MAX_CPUS};
use crate::cell::CellId;
use crate::Error;

pub mod features;

pub use features::{enable_features, CpuFeatures};

/// Highest extended-topology level probed
const MAX_TOPOLOGY_LEVELS: u32 = 8;
/// Extended topology level type: core
const LEVEL_TYPE_CORE: u32 = 2;
/// Extended topology level type: end of list
const LEVEL_TYPE_INVALID: u32 = 0;

/// Contiguous, half-open range of core identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreRange {
    start: u32,
    end: u32,
}

impl CoreRange {
    /// Cores `start..end`
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// First core
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the last core
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of cores
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, core: u32) -> bool {
        self.start <= core && core < self.end
    }

    /// Iterate over the core identifiers
    pub fn iter(&self) -> Range<u32> {
        self.start..self.end
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}-{}", self.start, self.end - 1)
        }
    }
}

/// How the core count was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologySource {
    /// CPUID leaf 0x0B core level
    ExtendedTopology,
    /// CPUID leaf 1 logical processor count
    Legacy,
    /// Nothing reported, assumed a single core
    Fallback,
}

/// Detected cores and their split between the cells
#[derive(Debug, Clone)]
pub struct CpuTopology {
    total: u32,
    source: TopologySource,
    ranges: [CoreRange; 2],
}

impl CpuTopology {
    /// Count the machine's cores
    ///
    /// Never fails: walks leaf 0x0B for the core level, falls back to leaf 1
    /// EBX[23:16], then to a single core. The result is clamped to `MAX_CPUS`.
    pub fn detect<P: Platform + ?Sized>(platform: &P) -> (u32, TopologySource) {
        let (count, source) = match extended_core_count(platform) {
            Some(count) => (count, TopologySource::ExtendedTopology),
            None => {
                log::warn!("{}", Error::HardwareUnavailable(crate::Capability::ExtendedTopology));
                match (platform.cpuid(1, 0).ebx >> 16) & 0xFF {
                    0 => (1, TopologySource::Fallback),
                    count => (count, TopologySource::Legacy),
                }
            }
        };

        if count as usize > MAX_CPUS {
            log::warn!("{} cores reported, using the first {}", count, MAX_CPUS);
            return (MAX_CPUS as u32, source);
        }
        (count, source)
    }

    /// Split `total` cores between the cells
    ///
    /// Linux takes `linux_cores` (half rounded up when unset) starting at core
    /// 0 and Windows the rest. A count larger than `total` is logged and
    /// replaced by the even split.
    pub fn partition(total: u32, source: TopologySource, linux_cores: Option<u32>) -> Self {
        let even = (total + 1) / 2;
        let linux = match linux_cores {
            Some(count) if count > 0 && count <= total => count,
            Some(count) => {
                log::error!(
                    "{}: {} linux cores requested, {} detected",
                    Error::Config("core split out of range"),
                    count,
                    total
                );
                even
            }
            None => even,
        };

        let ranges = [CoreRange::new(0, linux), CoreRange::new(linux, total)];
        if ranges[CellId::Windows.index()].is_empty() {
            log::warn!("windows cell owns no cores and cannot be resumed");
        }

        Self {
            total,
            source,
            ranges,
        }
    }

    /// Detect and partition in one step
    pub fn probe<P: Platform + ?Sized>(platform: &P, linux_cores: Option<u32>) -> Self {
        let (total, source) = Self::detect(platform);
        let topology = Self::partition(total, source, linux_cores);
        log::info!(
            "CPU: {} cores ({:?}), linux {}, windows {}",
            total,
            source,
            topology.range(CellId::Linux),
            topology.range(CellId::Windows)
        );
        topology
    }

    pub fn total_cores(&self) -> u32 {
        self.total
    }

    pub fn source(&self) -> TopologySource {
        self.source
    }

    /// Cores owned by `cell`
    pub fn range(&self, cell: CellId) -> CoreRange {
        self.ranges[cell.index()]
    }

    /// Cell owning `core`, `None` past the detected total
    pub fn owner_of(&self, core: u32) -> Option<CellId> {
        [CellId::Linux, CellId::Windows]
            .into_iter()
            .find(|cell| self.range(*cell).contains(core))
    }

    pub fn is_linux_core(&self, core: u32) -> bool {
        self.owner_of(core) == Some(CellId::Linux)
    }
}

/// Logical processor count of the core level of leaf 0x0B
fn extended_core_count<P: Platform + ?Sized>(platform: &P) -> Option<u32> {
    if platform.cpuid(0, 0).eax < 0x0B {
        return None;
    }

    for level in 0..MAX_TOPOLOGY_LEVELS {
        let leaf = platform.cpuid(0x0B, level);
        match (leaf.ecx >> 8) & 0xFF {
            LEVEL_TYPE_INVALID => break,
            LEVEL_TYPE_CORE => {
                let count = leaf.ebx & 0xFFFF;
                return if count > 0 { Some(count) } else { None };
            }
            _ => continue,
        }
    }
    None
}

/// Initial APIC id of the calling core
pub fn current_core_id<P: Platform + ?Sized>(platform: &P) -> u32 {
    platform.cpuid(1, 0).ebx >> 24
}
