//! Per-core freeze/thaw mailbox
//!
//! The control core posts a request word into the target core's slot and
//! kicks it with an NMI. The target core's NMI path calls [`CoreMailbox::park`]:
//! it stores its interrupted register frame, acknowledges the freeze, spins
//! until a thaw request arrives, reloads the (possibly restored) frame and
//! acknowledges the thaw.
//!
//! ## Protocol
//!
//! 1. control: `post(core, Freeze)` clears the ack word, then publishes the request
//! 2. target:  `park()` saves context, `ack = Freeze`
//! 3. control: reads context, copies memory, may `set_context()`
//! 4. control: `post(core, Thaw)`
//! 5. target:  reloads context, `ack = Thaw`, returns to the guest

use core::sync::atomic::{AtomicU32, Ordering};

use super::{CoreSignal, CpuContext, MAX_CPUS};
use crate::sync::SpinLock;

const NO_SIGNAL: u32 = 0;

/// One core's mailbox slot
struct MailboxSlot {
    /// Outstanding request from the control core
    request: AtomicU32,
    /// Last request this core acknowledged
    ack: AtomicU32,
    /// Register frame handed over while parked
    context: SpinLock<CpuContext>,
}

impl MailboxSlot {
    const fn new() -> Self {
        Self {
            request: AtomicU32::new(NO_SIGNAL),
            ack: AtomicU32::new(NO_SIGNAL),
            context: SpinLock::new(CpuContext::zeroed()),
        }
    }
}

/// Mailboxes for every core of the machine
pub struct CoreMailbox {
    slots: [MailboxSlot; MAX_CPUS],
}

impl CoreMailbox {
    /// Create a mailbox with no outstanding requests
    pub const fn new() -> Self {
        Self {
            slots: [const { MailboxSlot::new() }; MAX_CPUS],
        }
    }

    fn slot(&self, core: u32) -> Option<&MailboxSlot> {
        self.slots.get(core as usize)
    }

    /// Publish `signal` for `core`; returns false for an unknown core
    pub fn post(&self, core: u32, signal: CoreSignal) -> bool {
        match self.slot(core) {
            Some(slot) => {
                slot.ack.store(NO_SIGNAL, Ordering::SeqCst);
                slot.request.store(signal as u32, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Check whether `core` acknowledged `signal`
    pub fn acknowledged(&self, core: u32, signal: CoreSignal) -> bool {
        self.slot(core)
            .map(|slot| slot.ack.load(Ordering::SeqCst) == signal as u32)
            .unwrap_or(false)
    }

    /// Check whether `core` has a pending freeze request
    pub fn freeze_requested(&self, core: u32) -> bool {
        self.slot(core)
            .map(|slot| slot.request.load(Ordering::SeqCst) == CoreSignal::Freeze as u32)
            .unwrap_or(false)
    }

    /// Context handed over by a parked core
    pub fn context(&self, core: u32) -> CpuContext {
        self.slot(core)
            .map(|slot| *slot.context.lock())
            .unwrap_or_default()
    }

    /// Replace the context a parked core reloads on thaw
    pub fn set_context(&self, core: u32, context: &CpuContext) {
        if let Some(slot) = self.slot(core) {
            *slot.context.lock() = *context;
        }
    }

    /// Park the calling core until it is thawed
    ///
    /// Called on the target core from its NMI path with the interrupted
    /// frame. Returns false without parking if no freeze was requested.
    pub fn park(&self, core: u32, frame: &mut CpuContext) -> bool {
        let slot = match self.slot(core) {
            Some(slot) => slot,
            None => return false,
        };

        if slot.request.load(Ordering::SeqCst) != CoreSignal::Freeze as u32 {
            return false;
        }

        *slot.context.lock() = *frame;
        slot.ack.store(CoreSignal::Freeze as u32, Ordering::SeqCst);

        while slot.request.load(Ordering::SeqCst) != CoreSignal::Thaw as u32 {
            core::hint::spin_loop();
        }

        *frame = *slot.context.lock();
        slot.request.store(NO_SIGNAL, Ordering::SeqCst);
        slot.ack.store(CoreSignal::Thaw as u32, Ordering::SeqCst);
        true
    }
}

impl Default for CoreMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for(mailbox: &CoreMailbox, core: u32, signal: CoreSignal) {
        while !mailbox.acknowledged(core, signal) {
            thread::yield_now();
        }
    }

    #[test]
    fn test_park_hands_over_and_reloads_context() {
        let mailbox = Arc::new(CoreMailbox::new());
        assert!(mailbox.post(3, CoreSignal::Freeze));

        let target = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                let mut frame = CpuContext {
                    rip: 0x1000,
                    rsp: 0x8000,
                    ..CpuContext::zeroed()
                };
                // NMI arrives, core parks
                while !mailbox.freeze_requested(3) {
                    thread::yield_now();
                }
                assert!(mailbox.park(3, &mut frame));
                frame
            })
        };

        wait_for(&mailbox, 3, CoreSignal::Freeze);
        let saved = mailbox.context(3);
        assert_eq!(saved.rip, 0x1000);

        let restored = CpuContext {
            rip: 0x2000,
            ..saved
        };
        mailbox.set_context(3, &restored);
        assert!(mailbox.post(3, CoreSignal::Thaw));
        wait_for(&mailbox, 3, CoreSignal::Thaw);

        let frame = target.join().unwrap();
        assert_eq!(frame.rip, 0x2000);
        assert_eq!(frame.rsp, 0x8000);
    }

    #[test]
    fn test_park_without_request_returns_immediately() {
        let mailbox = CoreMailbox::new();
        let mut frame = CpuContext::zeroed();
        assert!(!mailbox.park(0, &mut frame));
        assert!(!mailbox.acknowledged(0, CoreSignal::Freeze));
    }

    #[test]
    fn test_unknown_core_is_rejected() {
        let mailbox = CoreMailbox::new();
        assert!(!mailbox.post(MAX_CPUS as u32, CoreSignal::Freeze));
        assert!(!mailbox.acknowledged(MAX_CPUS as u32, CoreSignal::Freeze));
    }
}
