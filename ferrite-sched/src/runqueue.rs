//! Per-CPU priority run queue.
//!
//! 140 intrusive FIFO lists (one per priority) threaded through
//! [`crate::thread::Thread::rq_prev`]/`rq_next`, plus a bitmap of
//! nonempty queues so picking the next thread is `count_trailing_zeros`
//! away rather than a linear scan.

use ferrite_core::id::Tid;

use crate::thread::{NUM_PRIORITIES, ThreadState, ThreadTable};

const BITMAP_WORDS: usize = NUM_PRIORITIES.div_ceil(64);

/// A per-CPU run queue. Carries no lock itself — callers (typically
/// [`crate::sched::Scheduler`]) hold a [`ferrite_core::sync::SpinLock`]
/// around both the queue and the [`ThreadTable`] it indexes into, since the
/// two must stay consistent under concurrent interrupt-context access.
pub struct RunQueue {
    heads: [Option<Tid>; NUM_PRIORITIES],
    tails: [Option<Tid>; NUM_PRIORITIES],
    bitmap: [u64; BITMAP_WORDS],
    nr_running: u32,
    /// Thread currently executing on this CPU, if any.
    pub current: Option<Tid>,
    /// This CPU's idle thread, run when no other thread is runnable.
    pub idle: Option<Tid>,
    switches: u64,
    ticks: u64,
}

impl RunQueue {
    /// Creates an empty run queue.
    pub const fn new() -> Self {
        Self {
            heads: [None; NUM_PRIORITIES],
            tails: [None; NUM_PRIORITIES],
            bitmap: [0; BITMAP_WORDS],
            nr_running: 0,
            current: None,
            idle: None,
            switches: 0,
            ticks: 0,
        }
    }

    fn bit_set(&mut self, p: usize) {
        self.bitmap[p / 64] |= 1 << (p % 64);
    }

    fn bit_clear(&mut self, p: usize) {
        self.bitmap[p / 64] &= !(1u64 << (p % 64));
    }

    /// Number of threads currently enqueued (excludes `current`/`idle`).
    pub fn nr_running(&self) -> u32 {
        self.nr_running
    }

    /// Total completed context switches on this queue.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Appends `tid` to the tail of its priority's FIFO and marks it
    /// `Running`. `tid` must not already be enqueued anywhere.
    pub fn add(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let priority = {
            let thread = threads.get_mut(tid).expect("sched_add: unknown tid");
            thread.state = ThreadState::Running;
            thread.rq_prev = None;
            thread.rq_next = None;
            thread.priority as usize
        };

        if let Some(tail) = self.tails[priority] {
            threads.get_mut(tail).expect("run queue tail missing").rq_next = Some(tid);
            threads.get_mut(tid).unwrap().rq_prev = Some(tail);
        } else {
            self.heads[priority] = Some(tid);
        }
        self.tails[priority] = Some(tid);
        self.bit_set(priority);
        self.nr_running += 1;
    }

    /// Unlinks `tid` from whichever priority queue it's on.
    pub fn remove(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let (priority, prev, next) = {
            let thread = threads.get(tid).expect("sched_remove: unknown tid");
            (thread.priority as usize, thread.rq_prev, thread.rq_next)
        };

        match prev {
            Some(p) => threads.get_mut(p).unwrap().rq_next = next,
            None => self.heads[priority] = next,
        }
        match next {
            Some(n) => threads.get_mut(n).unwrap().rq_prev = prev,
            None => self.tails[priority] = prev,
        }

        let thread = threads.get_mut(tid).unwrap();
        thread.rq_prev = None;
        thread.rq_next = None;

        if self.heads[priority].is_none() {
            self.bit_clear(priority);
        }
        self.nr_running -= 1;
    }

    /// Returns the highest-priority nonempty queue's head, without
    /// removing it.
    fn highest_nonempty(&self) -> Option<usize> {
        for (word, bits) in self.bitmap.iter().enumerate() {
            if *bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let priority = word * 64 + bit;
                if priority < NUM_PRIORITIES {
                    return Some(priority);
                }
            }
        }
        None
    }

    /// Removes and returns the highest-priority runnable thread, or `None`
    /// if every queue is empty (caller falls back to `idle`).
    pub fn pick(&mut self, threads: &mut ThreadTable) -> Option<Tid> {
        let priority = self.highest_nonempty()?;
        let head = self.heads[priority]?;
        self.remove(threads, head);
        Some(head)
    }

    /// Whether `tid` is currently linked into the `priority` list. A thread
    /// alone in its queue has `rq_prev == rq_next == None`, so membership
    /// can't be read off those links alone; checking the queue head covers
    /// that case.
    pub fn contains(&self, threads: &ThreadTable, tid: Tid, priority: u8) -> bool {
        if self.heads[priority as usize] == Some(tid) {
            return true;
        }
        threads.get(tid).is_some_and(|t| t.rq_prev.is_some() || t.rq_next.is_some())
    }

    /// Records one completed context switch.
    pub fn record_switch(&mut self) {
        self.switches += 1;
    }

    /// Advances the tick counter, returning the new count.
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    /// Total ticks observed by this run queue.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ferrite_core::id::Pid;

    use super::*;
    use crate::thread::Thread;

    fn table_with(tids: &[u32], priority: u8) -> ThreadTable {
        let mut table = ThreadTable::new();
        for &tid in tids {
            let mut t = Thread::new(Tid::new(tid), Pid::new(tid), priority, 0, 4096);
            t.priority = priority;
            table.insert(t).unwrap();
        }
        table
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut table = table_with(&[1, 2, 3], 120);
        let mut rq = RunQueue::new();
        rq.add(&mut table, Tid::new(1));
        rq.add(&mut table, Tid::new(2));
        rq.add(&mut table, Tid::new(3));
        assert_eq!(rq.pick(&mut table), Some(Tid::new(1)));
        assert_eq!(rq.pick(&mut table), Some(Tid::new(2)));
        assert_eq!(rq.pick(&mut table), Some(Tid::new(3)));
        assert_eq!(rq.pick(&mut table), None);
    }

    #[test]
    fn higher_priority_preempts_lower() {
        let mut table = ThreadTable::new();
        let mut low = Thread::new(Tid::new(1), Pid::new(1), 120, 0, 4096);
        low.priority = 120;
        let mut high = Thread::new(Tid::new(2), Pid::new(2), 50, 0, 4096);
        high.priority = 50;
        table.insert(low).unwrap();
        table.insert(high).unwrap();

        let mut rq = RunQueue::new();
        rq.add(&mut table, Tid::new(1));
        rq.add(&mut table, Tid::new(2));
        assert_eq!(rq.pick(&mut table), Some(Tid::new(2)));
        assert_eq!(rq.pick(&mut table), Some(Tid::new(1)));
    }

    #[test]
    fn bitmap_clears_when_queue_drains() {
        let mut table = table_with(&[1], 10);
        let mut rq = RunQueue::new();
        rq.add(&mut table, Tid::new(1));
        assert_eq!(rq.nr_running(), 1);
        rq.pick(&mut table);
        assert_eq!(rq.nr_running(), 0);
        assert_eq!(rq.highest_nonempty(), None);
    }

    #[test]
    fn remove_before_pick_unlinks_correctly() {
        let mut table = table_with(&[1, 2], 30);
        let mut rq = RunQueue::new();
        rq.add(&mut table, Tid::new(1));
        rq.add(&mut table, Tid::new(2));
        rq.remove(&mut table, Tid::new(1));
        assert_eq!(rq.pick(&mut table), Some(Tid::new(2)));
    }
}
