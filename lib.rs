//! Concordia - a static-partitioning hypervisor
//!
//! Concordia splits one physical machine into two cells, each with its own
//! CPU cores, memory range and passthrough devices. Exactly one cell runs at
//! a time; the other sits hibernated in a reserved memory image until the
//! switch hotkey hands the machine over.
//!
//! The crate contains the partition and cell-switch control plane. All
//! hardware access goes through [`arch::Platform`], so the same logic runs on
//! bare metal and against the simulated platform used by the tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use ::core::fmt;

// Support modules
#[macro_use]
pub mod utils;
pub mod config;
pub mod sync;

// Hardware access
pub mod arch;

// Partitioned resources
pub mod cpu;
pub mod mm;
pub mod iommu;

// Cell lifecycle and switching
pub mod cell;
pub mod switch;

// Hypervisor context
pub mod vmm;

pub use arch::Platform;
pub use cell::{CellId, CellState};
pub use config::PartitionConfig;
pub use vmm::{Event, Hypervisor};

/// Concordia version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Optional hardware capability that may be missing on a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// DMA translation controller
    Iommu,
    /// Streaming SIMD extensions
    Sse,
    /// Wide-vector (AVX) execution
    Avx,
    /// No-execute page protection
    NoExecute,
    /// Extended topology enumeration (CPUID leaf 0x0B)
    ExtendedTopology,
}

impl Capability {
    /// Get capability name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Iommu => "IOMMU",
            Capability::Sse => "SSE",
            Capability::Avx => "AVX",
            Capability::NoExecute => "NX",
            Capability::ExtendedTopology => "extended topology",
        }
    }
}

/// Common error type for Concordia
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid cell identifier or out-of-range parameter
    Config(&'static str),
    /// Optional capability is absent
    HardwareUnavailable(Capability),
    /// A core did not acknowledge a freeze/thaw request in time
    SyncTimeout {
        /// First core that failed to acknowledge
        core: u32,
    },
    /// A control register write did not read back as requested
    VerificationFailure {
        /// Physical address of the register
        register: u64,
    },
    /// Hypervisor-private region is out of space
    ResourceExhausted,
    /// Operation not allowed in the current lifecycle state
    InvalidState,
    /// Bulk memory copy primitive reported a fault
    CopyFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(reason) => write!(f, "configuration error: {}", reason),
            Error::HardwareUnavailable(cap) => write!(f, "{} not available", cap.as_str()),
            Error::SyncTimeout { core } => write!(f, "core {} did not acknowledge in time", core),
            Error::VerificationFailure { register } => {
                write!(f, "register {:#x} did not read back as written", register)
            }
            Error::ResourceExhausted => write!(f, "hypervisor memory exhausted"),
            Error::InvalidState => write!(f, "operation not valid in current cell state"),
            Error::CopyFailed => write!(f, "bulk memory copy failed"),
        }
    }
}

/// Result type alias
pub type Result<T> = ::core::result::Result<T, Error>;
