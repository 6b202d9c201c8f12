//! Notification objects: lightweight signaling, distinct from message
//! endpoints.
//!
//! A waiter here only ever needs to recheck a bitset after being woken —
//! no per-waiter payload crosses the wakeup, unlike [`crate::endpoint::Endpoint`]'s
//! rendezvous. That's exactly the shape [`ferrite_sched::WaitQueue`]
//! already provides, so this type is a thin accumulator built directly on
//! top of it rather than a second hand-rolled wait-record scheme.

use core::sync::atomic::{AtomicU64, Ordering};

use ferrite_sched::sched::Scheduler;
use ferrite_sched::waitqueue::WaitQueue;

/// A signaling object carrying a 64-bit accumulated bit set.
pub struct Notification {
    bits: AtomicU64,
    waiters: WaitQueue,
}

impl Notification {
    /// Creates a notification with an empty bit set.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// ORs `bits` into the accumulated set and wakes every waiter.
    pub fn signal(&self, scheduler: &Scheduler, bits: u64) {
        self.bits.fetch_or(bits, Ordering::AcqRel);
        self.waiters.wake_all(scheduler);
    }

    /// Returns the current bit set without blocking, atomically clearing
    /// it if it was nonzero.
    pub fn poll(&self) -> u64 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    /// Blocks until the bit set is nonzero, then atomically reads and
    /// clears it.
    ///
    /// Like the rest of this crate's blocking calls, this only suspends
    /// the caller with a real architecture context switch wired into
    /// `scheduler`; under a no-op test context switch it behaves as a
    /// single poll-and-park attempt (see the scheduler crate's own test
    /// conventions).
    pub fn wait(&self, scheduler: &Scheduler) -> u64 {
        loop {
            let observed = self.bits.swap(0, Ordering::AcqRel);
            if observed != 0 {
                return observed;
            }
            self.waiters.wait(scheduler, self as *const Self as u64);
        }
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ferrite_core::arch::x86_64::CpuContext;
    use ferrite_core::id::{Pid, Tid};
    use ferrite_sched::thread::Thread;

    use super::*;

    unsafe fn fake_switch(prev: *mut CpuContext, next: *const CpuContext) {
        unsafe {
            if !prev.is_null() {
                let _ = (*prev).rip;
            }
            let _ = (*next).rip;
        }
    }

    fn thread(tid: u32, priority: u8) -> Thread {
        Thread::new(Tid::new(tid), Pid::new(tid), priority, 0x5000, 8192)
    }

    #[test]
    fn poll_returns_and_clears_pending_bits() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        let n = Notification::new();
        n.signal(&sched, 0b101);
        assert_eq!(n.poll(), 0b101);
        assert_eq!(n.poll(), 0);
    }

    #[test]
    fn signal_ors_bits_accumulated_before_a_poll() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        let n = Notification::new();
        n.signal(&sched, 0b001);
        n.signal(&sched, 0b100);
        assert_eq!(n.poll(), 0b101);
    }

    #[test]
    fn wait_returns_immediately_when_bits_already_pending() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();

        let n = Notification::new();
        n.signal(&sched, 0b10);
        assert_eq!(n.wait(&sched), 0b10);
    }
}
