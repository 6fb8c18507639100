//! Synchronization primitives
//!
//! The control plane runs on a single thread, so the only shared state is
//! the published status and the per-core mailboxes. Both use these locks.

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
