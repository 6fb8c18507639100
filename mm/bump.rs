//! Bump allocator for the hypervisor-private region
//!
//! Hands out addresses by advancing a cursor. Nothing is ever reclaimed:
//! `free` is accepted and ignored.

use crate::{Error, Result};

/// Allocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BumpStats {
    /// Bytes handed out, alignment padding included
    pub used: u64,
    /// Bytes left before the region end
    pub remaining: u64,
    /// Successful allocations
    pub allocations: u64,
    /// Rejected allocations
    pub failures: u64,
}

/// Cursor allocator over `[start, end)`
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    start: u64,
    end: u64,
    cursor: u64,
    allocations: u64,
    failures: u64,
}

impl BumpAllocator {
    /// Allocator over `size` bytes starting at `start`
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
            cursor: start,
            allocations: 0,
            failures: 0,
        }
    }

    /// Next address that would be handed out
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Allocate `size` bytes at the cursor
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        self.allocate_aligned(size, 1)
    }

    /// Allocate `size` bytes at the next multiple of `align`
    ///
    /// Fails without moving the cursor when the request does not fit.
    pub fn allocate_aligned(&mut self, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::Config("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(Error::Config("alignment is not a power of two"));
        }

        let base = if is_aligned!(self.cursor, align) {
            Some(self.cursor)
        } else {
            self.cursor.checked_add(align - 1).map(|addr| addr & !(align - 1))
        };

        match base.and_then(|base| Some((base, base.checked_add(size)?))) {
            Some((base, next)) if next <= self.end => {
                self.cursor = next;
                self.allocations += 1;
                Ok(base)
            }
            _ => {
                self.failures += 1;
                log::warn!(
                    "hypervisor region exhausted: {:#x} bytes requested, {:#x} left",
                    size,
                    self.end - self.cursor
                );
                Err(Error::ResourceExhausted)
            }
        }
    }

    /// Release an allocation (no-op)
    pub fn free(&mut self, _addr: u64, _size: u64) {}

    pub fn stats(&self) -> BumpStats {
        BumpStats {
            used: self.cursor - self.start,
            remaining: self.end - self.cursor,
            allocations: self.allocations,
            failures: self.failures,
        }
    }
}
