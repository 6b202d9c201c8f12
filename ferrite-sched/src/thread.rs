//! Thread records and the fixed-capacity arena that owns them.
//!
//! Threads are stored in a flat array indexed by [`Tid`] rather than behind
//! individually heap-allocated nodes: the kernel has no allocator available
//! before the slab cache is up, and a fixed `MAX_THREADS` bound matches the
//! PID space's own fixed bitmap (`ferrite-sched` doesn't allocate PIDs
//! itself, but borrows the same "bounded, no-alloc" posture). Run-queue and
//! wait-queue membership are modeled as intrusive doubly/singly linked
//! lists over those same indices, per the typed intrusive-list idiom the
//! rest of this design favors over raw pointers.

use ferrite_core::arch::x86_64::CpuContext;
use ferrite_core::id::{Pid, Tid};

/// Upper bound on live threads. Matches the PID bitmap's order of
/// magnitude without needing the same 32 768-bit size: a uniprocessor
/// kernel core realistically never has tens of thousands of threads
/// in flight at once.
pub const MAX_THREADS: usize = 1024;

/// Number of priority levels, 0 (highest) .. 139 (lowest).
pub const NUM_PRIORITIES: usize = 140;

/// Real-time priorities occupy 0..=99.
pub const REALTIME_PRIORITY_MAX: u8 = 99;

/// Time-sharing priorities occupy 100..=139.
pub const TIMESHARE_PRIORITY_MIN: u8 = 100;
/// See [`TIMESHARE_PRIORITY_MIN`].
pub const TIMESHARE_PRIORITY_MAX: u8 = (NUM_PRIORITIES - 1) as u8;

/// Default priority for a newly created time-sharing thread (nice 0).
pub const DEFAULT_PRIORITY: u8 = 120;

/// Default time slice, in timer ticks (100 Hz tick, so 10 ticks = 100 ms).
pub const DEFAULT_TIMESLICE: u32 = 10;

/// Maps a POSIX-style nice value (-20..=19) to a time-sharing priority
/// (100..=139).
pub const fn nice_to_priority(nice: i8) -> u8 {
    let nice = if nice < -20 {
        -20
    } else if nice > 19 {
        19
    } else {
        nice
    };
    (TIMESHARE_PRIORITY_MIN as i32 + nice as i32 + 20) as u8
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On a run queue or currently executing.
    Running,
    /// Blocked, wakeable by a signal-equivalent event (channel wake, IPC).
    Interruptible,
    /// Blocked, not wakeable except by the specific event it's waiting for.
    Uninterruptible,
    /// Stopped (job-control equivalent); not runnable until continued.
    Stopped,
    /// Exited; resources not yet reclaimed by `wait()`.
    Zombie,
    /// Fully reaped; the record is about to be freed.
    Dead,
}

bitflags::bitflags! {
    /// Per-thread flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Kernel-only thread; has no user address space.
        const KTHREAD       = 1 << 0;
        /// The per-CPU idle thread.
        const IDLE          = 1 << 1;
        /// Set by an interrupt handler or `sched_tick`; consulted at the
        /// next preempt-enable or return-to-user boundary.
        const NEED_RESCHED  = 1 << 2;
        /// Thread has called `exit()` and is tearing down.
        const EXITING       = 1 << 3;
        /// Thread is mid-`fork()`; used to gate syscall-frame replay.
        const FORKING       = 1 << 4;
    }
}

/// A schedulable thread.
pub struct Thread {
    /// Thread identifier, unique system-wide.
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    /// Current scheduling state.
    pub state: ThreadState,
    /// Per-thread flags.
    pub flags: ThreadFlags,
    /// Scheduling priority, 0 (highest) .. 139 (lowest).
    pub priority: u8,
    /// POSIX-style nice value, meaningful for time-sharing priorities only.
    pub nice: i8,
    /// Remaining time slice, in ticks, until forced reschedule.
    pub timeslice: u32,
    /// Saved callee-saved register context, restored on switch-in.
    pub context: CpuContext,
    /// Base of this thread's kernel stack.
    pub kernel_stack_base: u64,
    /// Size of the kernel stack in bytes.
    pub kernel_stack_size: usize,
    /// Saved user-mode stack pointer (meaningless for kernel threads).
    pub user_rsp: u64,
    /// Opaque channel this thread is blocked on, or `None` if runnable.
    /// Any stable address (a wait-queue's own address, a process pointer,
    /// `&parent` for `wait()`) can serve as a channel per the original
    /// `thread_sleep`/`thread_wakeup` design.
    pub wait_channel: Option<u64>,
    pub(crate) rq_prev: Option<Tid>,
    pub(crate) rq_next: Option<Tid>,
    pub(crate) list_next: Option<Tid>,
    /// Link for an explicit [`crate::waitqueue::WaitQueue`] chain. Distinct
    /// from `list_next`, which is permanently claimed by the global
    /// all-threads list the moment a thread is inserted.
    pub(crate) wq_next: Option<Tid>,
}

impl Thread {
    /// Builds a new thread record in the `Interruptible` state with no
    /// queue membership. Callers add it to a run queue once its initial
    /// context is ready to execute (see `ferrite-sched::sched`).
    pub fn new(tid: Tid, pid: Pid, priority: u8, kernel_stack_base: u64, kernel_stack_size: usize) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Interruptible,
            flags: ThreadFlags::empty(),
            priority: priority.min(TIMESHARE_PRIORITY_MAX),
            nice: 0,
            timeslice: DEFAULT_TIMESLICE,
            context: CpuContext::default(),
            kernel_stack_base,
            kernel_stack_size,
            user_rsp: 0,
            wait_channel: None,
            rq_prev: None,
            rq_next: None,
            list_next: None,
            wq_next: None,
        }
    }

    /// Top of the kernel stack, 8-byte aligned below the end per the x86_64
    /// calling convention's expectations on entry.
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_base + self.kernel_stack_size as u64 - 8
    }
}

/// Errors from [`ThreadTable`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadTableError {
    /// The arena has no free slots.
    Full,
    /// The slot for this [`Tid`] is out of range or already occupied/empty
    /// as appropriate for the operation.
    InvalidSlot,
}

impl core::fmt::Display for ThreadTableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ThreadTableError::Full => write!(f, "thread table full"),
            ThreadTableError::InvalidSlot => write!(f, "invalid thread slot"),
        }
    }
}

/// Fixed-capacity arena owning every live [`Thread`], indexed by [`Tid`].
pub struct ThreadTable {
    slots: [Option<Thread>; MAX_THREADS],
    pub(crate) all_threads_head: Option<Tid>,
}

impl ThreadTable {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            all_threads_head: None,
        }
    }

    /// Inserts `thread` at the slot given by its own `tid`, linking it into
    /// the global thread list used by [`crate::sched::wakeup_channel`].
    pub fn insert(&mut self, mut thread: Thread) -> Result<(), ThreadTableError> {
        let idx = thread.tid.as_u32() as usize;
        let slot = self.slots.get_mut(idx).ok_or(ThreadTableError::InvalidSlot)?;
        if slot.is_some() {
            return Err(ThreadTableError::InvalidSlot);
        }
        thread.list_next = self.all_threads_head;
        self.all_threads_head = Some(thread.tid);
        *slot = Some(thread);
        Ok(())
    }

    /// Removes and returns the thread at `tid`, unlinking it from the
    /// global thread list.
    pub fn remove(&mut self, tid: Tid) -> Option<Thread> {
        let idx = tid.as_u32() as usize;
        let removed = self.slots.get_mut(idx)?.take()?;
        if self.all_threads_head == Some(tid) {
            self.all_threads_head = removed.list_next;
        } else {
            let mut cursor = self.all_threads_head;
            while let Some(cur) = cursor {
                let next = self.slots[cur.as_u32() as usize].as_ref().and_then(|t| t.list_next);
                if next == Some(tid) {
                    self.slots[cur.as_u32() as usize].as_mut().unwrap().list_next = removed.list_next;
                    break;
                }
                cursor = next;
            }
        }
        Some(removed)
    }

    /// Returns a reference to the thread at `tid`, if live.
    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.slots.get(tid.as_u32() as usize)?.as_ref()
    }

    /// Returns a mutable reference to the thread at `tid`, if live.
    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.slots.get_mut(tid.as_u32() as usize)?.as_mut()
    }

    /// Walks every live thread whose `wait_channel` equals `channel` and
    /// whose state is blocked, invoking `f` for each. Mirrors
    /// `thread_wakeup`'s walk of the global thread list under lock.
    pub fn for_each_waiting_on(&mut self, channel: u64, mut f: impl FnMut(&mut Thread)) {
        let mut cursor = self.all_threads_head;
        while let Some(tid) = cursor {
            let idx = tid.as_u32() as usize;
            let next = self.slots[idx].as_ref().and_then(|t| t.list_next);
            if let Some(t) = self.slots[idx].as_mut() {
                if t.wait_channel == Some(channel)
                    && matches!(t.state, ThreadState::Interruptible | ThreadState::Uninterruptible)
                {
                    f(t);
                }
            }
            cursor = next;
        }
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(tid: u32) -> Thread {
        Thread::new(Tid::new(tid), Pid::new(tid), DEFAULT_PRIORITY, 0x1000, 8192)
    }

    #[test]
    fn nice_mapping_clamps_and_centers() {
        assert_eq!(nice_to_priority(0), 120);
        assert_eq!(nice_to_priority(-20), 100);
        assert_eq!(nice_to_priority(19), 139);
        assert_eq!(nice_to_priority(-100), 100);
        assert_eq!(nice_to_priority(100), 139);
    }

    #[test]
    fn kernel_stack_top_is_base_plus_size_minus_8() {
        let t = mk(1);
        assert_eq!(t.kernel_stack_top(), 0x1000 + 8192 - 8);
    }

    #[test]
    fn insert_and_remove_roundtrip() {
        let mut table = ThreadTable::new();
        table.insert(mk(5)).unwrap();
        assert!(table.get(Tid::new(5)).is_some());
        let removed = table.remove(Tid::new(5)).unwrap();
        assert_eq!(removed.tid, Tid::new(5));
        assert!(table.get(Tid::new(5)).is_none());
    }

    #[test]
    fn insert_duplicate_slot_fails() {
        let mut table = ThreadTable::new();
        table.insert(mk(3)).unwrap();
        assert_eq!(table.insert(mk(3)).unwrap_err(), ThreadTableError::InvalidSlot);
    }

    #[test]
    fn for_each_waiting_on_finds_matching_channel() {
        let mut table = ThreadTable::new();
        let mut a = mk(1);
        a.wait_channel = Some(0xAAAA);
        a.state = ThreadState::Interruptible;
        let mut b = mk(2);
        b.wait_channel = Some(0xBBBB);
        b.state = ThreadState::Interruptible;
        table.insert(a).unwrap();
        table.insert(b).unwrap();

        let mut woken = 0;
        table.for_each_waiting_on(0xAAAA, |t| {
            t.state = ThreadState::Running;
            woken += 1;
        });
        assert_eq!(woken, 1);
        assert_eq!(table.get(Tid::new(1)).unwrap().state, ThreadState::Running);
        assert_eq!(table.get(Tid::new(2)).unwrap().state, ThreadState::Interruptible);
    }
}
