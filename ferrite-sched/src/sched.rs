//! The `schedule()` suspension point and the policy built on top of it:
//! preemption accounting, the timer tick, and channel-based sleep/wake.
//!
//! The actual register save/restore is not linked in directly. Instead
//! [`Scheduler::new`] takes a [`ContextSwitchFn`] function pointer, so this
//! whole module runs under `cargo test` on the host with a stub that just
//! copies a pretend instruction pointer around, while the kernel build wires
//! in `ferrite_core::arch::x86_64::switch_context`.

use ferrite_core::arch::x86_64::CpuContext;
use ferrite_core::id::Tid;
use ferrite_core::sync::SpinLock;

use crate::runqueue::RunQueue;
use crate::thread::{DEFAULT_TIMESLICE, Thread, ThreadFlags, ThreadState, ThreadTable, ThreadTableError};

/// Performs the actual register save/restore between two threads.
///
/// `prev` may be null when there is no previous thread to save into (the
/// very first `schedule()` call on a CPU). `next` is never null.
///
/// # Safety
///
/// Both pointers must reference live [`CpuContext`]s that are not being
/// concurrently accessed, and must remain valid until the function returns
/// control into whichever context it switched to.
pub type ContextSwitchFn = unsafe fn(prev: *mut CpuContext, next: *const CpuContext);

/// Errors from scheduler operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No such thread is registered with the scheduler.
    NoSuchThread,
    /// The thread table has no free slots.
    TableFull,
}

impl From<ThreadTableError> for SchedError {
    fn from(e: ThreadTableError) -> Self {
        match e {
            ThreadTableError::Full => SchedError::TableFull,
            ThreadTableError::InvalidSlot => SchedError::NoSuchThread,
        }
    }
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedError::NoSuchThread => write!(f, "no such thread"),
            SchedError::TableFull => write!(f, "thread table full"),
        }
    }
}

struct SchedState {
    rq: RunQueue,
    threads: ThreadTable,
}

/// A single CPU's scheduler: one run queue, one thread table, one
/// preemption count. The spec's uniprocessor scope means one `Scheduler`
/// instance is the whole system; a per-CPU array of these is the natural
/// extension point if that scope ever widens.
pub struct Scheduler {
    state: SpinLock<SchedState>,
    preempt_count: core::sync::atomic::AtomicU32,
    ticks: core::sync::atomic::AtomicU64,
    context_switch: ContextSwitchFn,
}

impl Scheduler {
    /// Creates a scheduler with empty run queue and thread table.
    pub const fn new(context_switch: ContextSwitchFn) -> Self {
        Self {
            state: SpinLock::new(SchedState {
                rq: RunQueue::new(),
                threads: ThreadTable::new(),
            }),
            preempt_count: core::sync::atomic::AtomicU32::new(0),
            ticks: core::sync::atomic::AtomicU64::new(0),
            context_switch,
        }
    }

    /// Registers `thread` with the scheduler and marks it runnable.
    pub fn spawn(&self, thread: Thread) -> Result<Tid, SchedError> {
        let mut state = self.state.lock();
        let tid = thread.tid;
        state.threads.insert(thread)?;
        state.rq.add(&mut state.threads, tid);
        Ok(tid)
    }

    /// Registers `thread` as the CPU's idle thread without enqueuing it;
    /// the run queue falls back to it whenever nothing else is runnable.
    pub fn set_idle(&self, mut thread: Thread) -> Result<Tid, SchedError> {
        thread.flags.insert(ThreadFlags::KTHREAD | ThreadFlags::IDLE);
        let tid = thread.tid;
        let mut state = self.state.lock();
        state.threads.insert(thread)?;
        state.rq.idle = Some(tid);
        if state.rq.current.is_none() {
            state.rq.current = Some(tid);
        }
        Ok(tid)
    }

    /// Currently executing thread, if the scheduler has been bootstrapped.
    pub fn current(&self) -> Option<Tid> {
        self.state.lock().rq.current
    }

    /// Number of threads waiting to run (excludes `current` and `idle`).
    pub fn nr_running(&self) -> u32 {
        self.state.lock().rq.nr_running()
    }

    /// Total timer ticks observed.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(core::sync::atomic::Ordering::Relaxed)
    }

    /// Raises the preemption count, suppressing nested reschedules.
    pub fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
    }

    /// Lowers the preemption count; if it reaches zero and the current
    /// thread has `NEED_RESCHED` set, calls [`Scheduler::schedule`].
    pub fn preempt_enable(&self) {
        let prev = self.preempt_count.fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
        if prev == 1 {
            let need_resched = {
                let state = self.state.lock();
                state
                    .rq
                    .current
                    .and_then(|tid| state.threads.get(tid))
                    .is_some_and(|t| t.flags.contains(ThreadFlags::NEED_RESCHED))
            };
            if need_resched {
                self.schedule();
            }
        }
    }

    /// Current preemption depth; zero means preemption is enabled.
    pub fn preempt_count(&self) -> u32 {
        self.preempt_count.load(core::sync::atomic::Ordering::Acquire)
    }

    /// The scheduler's suspension point. Re-enqueues the outgoing thread if
    /// it's still runnable, picks the next thread (falling back to idle),
    /// and switches to it if it differs from the one already running.
    pub fn schedule(&self) {
        self.preempt_disable();

        let switch = {
            let mut state = self.state.lock();
            if state.rq.current.is_none() {
                state.rq.current = state.rq.idle;
            }
            let prev = state.rq.current;

            if let Some(prev_tid) = prev {
                let should_requeue = state
                    .threads
                    .get(prev_tid)
                    .is_some_and(|t| t.state == ThreadState::Running)
                    && Some(prev_tid) != state.rq.idle;
                if should_requeue {
                    state.rq.add(&mut state.threads, prev_tid);
                }
            }

            let next = state.rq.pick(&mut state.threads).or(state.rq.idle);

            if next.is_none() || next == prev {
                None
            } else {
                let next_tid = next.unwrap();
                state.rq.current = next;
                state.rq.record_switch();
                if let Some(t) = state.threads.get_mut(next_tid) {
                    t.flags.remove(ThreadFlags::NEED_RESCHED);
                }

                let prev_ptr = prev
                    .and_then(|tid| state.threads.get_mut(tid))
                    .map_or(core::ptr::null_mut(), |t| &mut t.context as *mut CpuContext);
                let next_ptr = state
                    .threads
                    .get(next_tid)
                    .map(|t| &t.context as *const CpuContext)
                    .expect("picked thread vanished from table between pick() and switch");

                Some((prev_ptr, next_ptr))
            }
        };

        if let Some((prev_ptr, next_ptr)) = switch {
            // SAFETY: both threads are live in the table and not touched by
            // anyone else while this CPU's preemption count is nonzero.
            unsafe {
                (self.context_switch)(prev_ptr, next_ptr);
            }
        }

        self.preempt_enable();
    }

    /// Voluntarily yields the CPU.
    pub fn yield_now(&self) {
        {
            let mut state = self.state.lock();
            if let Some(tid) = state.rq.current {
                if let Some(t) = state.threads.get_mut(tid) {
                    t.flags.insert(ThreadFlags::NEED_RESCHED);
                }
            }
        }
        self.schedule();
    }

    /// Timer interrupt handler: advances the tick counter and decrements
    /// the current thread's time slice, flagging a reschedule once it's
    /// exhausted.
    pub fn sched_tick(&self) {
        self.ticks.fetch_add(1, core::sync::atomic::Ordering::AcqRel);

        let mut state = self.state.lock();
        state.rq.tick();
        let current = state.rq.current;
        let idle = state.rq.idle;

        match current {
            Some(tid) if Some(tid) != idle => {
                if let Some(t) = state.threads.get_mut(tid) {
                    if t.timeslice > 1 {
                        t.timeslice -= 1;
                    } else {
                        t.timeslice = DEFAULT_TIMESLICE;
                        t.flags.insert(ThreadFlags::NEED_RESCHED);
                    }
                }
            }
            Some(tid) => {
                if state.rq.nr_running() > 0 {
                    if let Some(t) = state.threads.get_mut(tid) {
                        t.flags.insert(ThreadFlags::NEED_RESCHED);
                    }
                }
            }
            None => {}
        }
    }

    /// Blocks the current thread on `channel` until a matching
    /// [`Scheduler::thread_wakeup`]. `channel` is any stable address that
    /// identifies what's being waited for: a wait queue's own address, a
    /// parent process pointer for `wait()`, or a message-rendezvous slot.
    pub fn thread_sleep(&self, channel: u64) {
        {
            let mut state = self.state.lock();
            if let Some(tid) = state.rq.current {
                if let Some(t) = state.threads.get_mut(tid) {
                    t.wait_channel = Some(channel);
                    t.state = ThreadState::Interruptible;
                }
            }
        }

        self.schedule();

        let mut state = self.state.lock();
        if let Some(tid) = state.rq.current {
            if let Some(t) = state.threads.get_mut(tid) {
                t.wait_channel = None;
            }
        }
    }

    /// Wakes every thread blocked on `channel`.
    ///
    /// Walks the global thread list directly rather than through
    /// [`ThreadTable::for_each_waiting_on`], since re-enqueuing a woken
    /// thread needs a second mutable borrow of the table that a closure
    /// running inside that method can't take out at the same time.
    pub fn thread_wakeup(&self, channel: u64) {
        let mut state = self.state.lock();
        let mut cursor = state.threads.all_threads_head;
        while let Some(tid) = cursor {
            cursor = state.threads.get(tid).and_then(|t| t.list_next);

            let should_wake = state.threads.get(tid).is_some_and(|t| {
                t.wait_channel == Some(channel)
                    && matches!(t.state, ThreadState::Interruptible | ThreadState::Uninterruptible)
            });
            if !should_wake {
                continue;
            }

            if let Some(t) = state.threads.get_mut(tid) {
                t.state = ThreadState::Running;
                t.timeslice = DEFAULT_TIMESLICE;
            }
            state.rq.add(&mut state.threads, tid);
        }
    }

    /// Changes `tid`'s priority, re-homing it in the run queue if it's
    /// currently enqueued.
    pub fn set_priority(&self, tid: Tid, priority: u8) -> Result<(), SchedError> {
        let priority = priority.min(crate::thread::TIMESHARE_PRIORITY_MAX);
        let mut state = self.state.lock();
        let old_priority = state.threads.get(tid).ok_or(SchedError::NoSuchThread)?.priority;

        if state.rq.contains(&state.threads, tid, old_priority) {
            state.rq.remove(&mut state.threads, tid);
            state.threads.get_mut(tid).unwrap().priority = priority;
            state.rq.add(&mut state.threads, tid);
        } else {
            state.threads.get_mut(tid).unwrap().priority = priority;
        }
        Ok(())
    }

    /// Sets `tid`'s nice value, mapping it to a time-sharing priority.
    pub fn set_nice(&self, tid: Tid, nice: i8) -> Result<(), SchedError> {
        let nice = nice.clamp(-20, 19);
        let priority = crate::thread::nice_to_priority(nice);
        {
            let mut state = self.state.lock();
            let t = state.threads.get_mut(tid).ok_or(SchedError::NoSuchThread)?;
            t.nice = nice;
        }
        self.set_priority(tid, priority)
    }

    /// Marks a blocked thread runnable and re-enqueues it, bypassing the
    /// channel match [`Scheduler::thread_wakeup`] does. Used by
    /// [`crate::waitqueue::WaitQueue`], which already knows exactly which
    /// thread to wake.
    pub(crate) fn wake_thread(&self, tid: Tid) {
        let mut state = self.state.lock();
        let should_wake = state
            .threads
            .get(tid)
            .is_some_and(|t| matches!(t.state, ThreadState::Interruptible | ThreadState::Uninterruptible));
        if !should_wake {
            return;
        }
        if let Some(t) = state.threads.get_mut(tid) {
            t.state = ThreadState::Running;
            t.timeslice = DEFAULT_TIMESLICE;
            t.wait_channel = None;
        }
        state.rq.add(&mut state.threads, tid);
    }

    /// Marks the current thread `Zombie` and switches away from it. The
    /// slot stays occupied — `wait()` on the owning process reaps it via
    /// [`Scheduler::reap`] once a parent has collected the exit status.
    pub fn exit_current(&self) {
        {
            let mut state = self.state.lock();
            if let Some(tid) = state.rq.current {
                if let Some(t) = state.threads.get_mut(tid) {
                    t.state = ThreadState::Zombie;
                    t.flags.insert(ThreadFlags::EXITING);
                }
                if Some(tid) != state.rq.idle {
                    state.rq.current = None;
                }
            }
        }
        self.schedule();
    }

    /// Removes and returns the thread record at `tid`. Used to reclaim a
    /// zombie thread's slot after its exit status has been collected.
    pub fn reap(&self, tid: Tid) -> Option<Thread> {
        self.state.lock().threads.remove(tid)
    }

    /// Reads `tid`'s wait-queue link, used by
    /// [`crate::waitqueue::WaitQueue`] to thread its own FIFO.
    pub(crate) fn thread_wq_next(&self, tid: Tid) -> Option<Tid> {
        self.state.lock().threads.get(tid).and_then(|t| t.wq_next)
    }

    /// Sets `tid`'s wait-queue link. See [`Scheduler::thread_wq_next`].
    pub(crate) fn set_thread_wq_next(&self, tid: Tid, next: Option<Tid>) {
        let mut state = self.state.lock();
        if let Some(t) = state.threads.get_mut(tid) {
            t.wq_next = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use ferrite_core::id::Pid;

    use super::*;

    // Host-side stand-in for the real register switch: records the
    // transition instead of touching any registers.
    static LAST_SWITCH: SpinLock<(u64, u64)> = SpinLock::new((0, 0));

    unsafe fn fake_switch(prev: *mut CpuContext, next: *const CpuContext) {
        unsafe {
            let prev_rip = if prev.is_null() { 0 } else { (*prev).rip };
            let next_rip = (*next).rip;
            *LAST_SWITCH.lock() = (prev_rip, next_rip);
        }
    }

    fn thread(tid: u32, priority: u8) -> Thread {
        let mut t = Thread::new(Tid::new(tid), Pid::new(tid), priority, 0x2000, 8192);
        t.priority = priority;
        t.context.rip = tid as u64;
        t
    }

    #[test]
    fn schedule_picks_idle_when_nothing_runnable() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(0)));
    }

    #[test]
    fn schedule_prefers_higher_priority() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 120)).unwrap();
        sched.spawn(thread(2, 50)).unwrap();
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(2)));
    }

    #[test]
    fn running_thread_requeues_behind_equal_priority_peers() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.spawn(thread(2, 100)).unwrap();

        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(2)));
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));
    }

    #[test]
    fn sleep_and_wakeup_roundtrip() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));

        sched.thread_sleep(0xCAFE);
        // thread_sleep's own schedule() call leaves idle running since
        // thread 1 is no longer Running.
        assert_eq!(sched.current(), Some(Tid::new(0)));

        sched.thread_wakeup(0xCAFE);
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));
    }

    #[test]
    fn sched_tick_expires_timeslice_and_flags_resched() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();
        let tid = sched.current().unwrap();

        for _ in 0..DEFAULT_TIMESLICE {
            sched.sched_tick();
        }

        let state = sched.state.lock();
        let t = state.threads.get(tid).unwrap();
        assert!(t.flags.contains(ThreadFlags::NEED_RESCHED));
    }

    #[test]
    fn set_priority_rehomes_enqueued_thread() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.spawn(thread(2, 50)).unwrap();

        sched.set_priority(Tid::new(1), 10).unwrap();
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));
    }

    #[test]
    fn set_nice_maps_to_timeshare_priority() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 120)).unwrap();
        sched.set_nice(Tid::new(1), -20).unwrap();
        let state = sched.state.lock();
        assert_eq!(state.threads.get(Tid::new(1)).unwrap().priority, 100);
    }

    #[test]
    fn exit_current_marks_zombie_and_switches_to_idle() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();
        assert_eq!(sched.current(), Some(Tid::new(1)));

        sched.exit_current();
        assert_eq!(sched.current(), Some(Tid::new(0)));

        let state = sched.state.lock();
        let t = state.threads.get(Tid::new(1)).unwrap();
        assert_eq!(t.state, ThreadState::Zombie);
        assert!(t.flags.contains(ThreadFlags::EXITING));
    }

    #[test]
    fn reap_removes_the_thread_record() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();
        sched.exit_current();

        assert!(sched.reap(Tid::new(1)).is_some());
        let state = sched.state.lock();
        assert!(state.threads.get(Tid::new(1)).is_none());
    }
}
