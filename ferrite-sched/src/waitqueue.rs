//! Explicit wait queues, for blocking on a specific event rather than an
//! arbitrary channel address.
//!
//! Where [`crate::sched::Scheduler::thread_sleep`]/`thread_wakeup` suit a
//! one-off rendezvous (a single IPC reply, a child exiting), a `WaitQueue`
//! models a long-lived FIFO of waiters — the shape condvars and blocking
//! I/O eventually need.

use ferrite_core::id::Tid;
use ferrite_core::sync::SpinLock;

use crate::sched::Scheduler;

/// A FIFO of threads blocked on the same event, threaded through each
/// thread's dedicated wait-queue link rather than the global thread list's.
pub struct WaitQueue {
    head: SpinLock<Option<Tid>>,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self { head: SpinLock::new(None) }
    }

    /// Blocks the calling thread until [`WaitQueue::wake_one`] or
    /// [`WaitQueue::wake_all`] removes it.
    ///
    /// `channel` identifies this queue to `scheduler`'s channel-based
    /// sleep/wake; pass the wait queue's own address cast to `u64`.
    pub fn wait(&self, scheduler: &Scheduler, channel: u64) {
        if let Some(tid) = scheduler.current() {
            let mut head = self.head.lock();
            scheduler.set_thread_wq_next(tid, *head);
            *head = Some(tid);
        }
        scheduler.thread_sleep(channel);
    }

    /// Wakes the longest-waiting thread, if any.
    pub fn wake_one(&self, scheduler: &Scheduler) {
        let mut head = self.head.lock();
        if let Some(tid) = *head {
            *head = scheduler.thread_wq_next(tid);
            scheduler.wake_thread(tid);
        }
    }

    /// Wakes every waiting thread.
    pub fn wake_all(&self, scheduler: &Scheduler) {
        let mut head = self.head.lock();
        let mut cursor = head.take();
        while let Some(tid) = cursor {
            cursor = scheduler.thread_wq_next(tid);
            scheduler.wake_thread(tid);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ferrite_core::arch::x86_64::CpuContext;
    use ferrite_core::id::Pid;

    use super::*;
    use crate::thread::Thread;

    unsafe fn fake_switch(prev: *mut CpuContext, next: *const CpuContext) {
        unsafe {
            if !prev.is_null() {
                let _ = (*prev).rip;
            }
            let _ = (*next).rip;
        }
    }

    fn thread(tid: u32, priority: u8) -> Thread {
        Thread::new(Tid::new(tid), Pid::new(tid), priority, 0x3000, 8192)
    }

    #[test]
    fn wait_then_wake_one_resumes_single_waiter() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));

        let wq = WaitQueue::new();
        wq.wait(&sched, 0x1000);
        assert_eq!(sched.current(), Some(Tid::new(0)));

        wq.wake_one(&sched);
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));
    }

    #[test]
    fn wake_all_resumes_every_waiter() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.spawn(thread(2, 100)).unwrap();

        let wq = WaitQueue::new();

        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));
        wq.wait(&sched, 0x2000);

        assert_eq!(sched.current(), Some(Tid::new(2)));
        wq.wait(&sched, 0x2000);

        assert_eq!(sched.current(), Some(Tid::new(0)));
        wq.wake_all(&sched);
        assert_eq!(sched.nr_running(), 2);
    }
}
