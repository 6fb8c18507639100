//! Freeze/thaw rendezvous
//!
//! Posts a signal to every core of a range, then polls acknowledgments until
//! all cores have answered or the timeout expires.

use crate::arch::{CoreSignal, Platform};
use crate::cpu::CoreRange;
use crate::{Error, Result};

/// Bounded signal-and-acknowledge barrier over a core range
#[derive(Debug, Clone, Copy)]
pub struct FreezeBarrier {
    timeout_us: u64,
}

impl FreezeBarrier {
    pub fn new(timeout_us: u64) -> Self {
        Self { timeout_us }
    }

    pub fn timeout_us(&self) -> u64 {
        self.timeout_us
    }

    /// Signal every core in `cores` and wait for all acknowledgments
    ///
    /// Fails with `SyncTimeout` naming the lowest core still pending when the
    /// timeout expires. Cores that did acknowledge stay in the signalled state.
    pub fn rendezvous<P: Platform + ?Sized>(
        &self,
        platform: &mut P,
        cores: CoreRange,
        signal: CoreSignal,
    ) -> Result<()> {
        if cores.end() > u64::BITS {
            return Err(Error::Config("core range exceeds barrier width"));
        }

        let mut pending = 0u64;
        for core in cores.iter() {
            platform.signal_core(core, signal)?;
            pending |= 1 << core;
        }

        let start = platform.monotonic_us();
        loop {
            let mut waiting = pending;
            while waiting != 0 {
                let core = waiting.trailing_zeros();
                waiting &= waiting - 1;
                if platform.core_acknowledged(core, signal) {
                    pending &= !(1 << core);
                }
            }

            if pending == 0 {
                log::trace!("{} acknowledged by cores {}", signal.as_str(), cores);
                return Ok(());
            }

            if platform.monotonic_us().saturating_sub(start) >= self.timeout_us {
                let core = pending.trailing_zeros();
                log::error!(
                    "{} barrier timed out after {} us, pending mask {:#x}",
                    signal.as_str(),
                    self.timeout_us,
                    pending
                );
                return Err(Error::SyncTimeout { core });
            }

            core::hint::spin_loop();
        }
    }
}
