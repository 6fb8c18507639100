//! Utility functions and macros
//!
//! Logging backend and small address helpers used throughout the hypervisor.

pub mod logger;

pub use self::logger::level;

/// Check if `addr` is a multiple of `align`
#[macro_export]
macro_rules! is_aligned {
    ($addr:expr, $align:expr) => {
        $addr % $align == 0
    };
}

/// Size constants
pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned!(2 * MIB, MIB));
        assert!(!is_aligned!(MIB + 1, MIB));
    }
}
