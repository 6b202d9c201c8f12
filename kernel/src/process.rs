//! Process records layered on top of `ferrite_sched::thread::{Thread, ThreadTable}`.
//!
//! A [`Thread`] already carries everything the scheduler needs to run a
//! thread; a [`Process`] adds the process-level bookkeeping the scheduler
//! doesn't know about: credentials, the address space, and the
//! parent/child tree used by `wait()`/reparenting. Like `ThreadTable`,
//! processes live in a flat array indexed by PID rather than behind
//! individually heap-allocated nodes.

use ferrite_core::id::{Pid, Tid};
use ferrite_ipc::capability::CapabilitySpace;
use ferrite_sched::thread::MAX_THREADS;

/// Upper bound on live processes. Bounded by the thread table's own
/// capacity: every process has at least a main thread, and
/// `ferrite_sched::thread::ThreadTable` can only hold `MAX_THREADS` live
/// threads at once, so there is never a point in tracking more live
/// processes than that. The PID bitmap's much larger 32768-bit space
/// exists to avoid PID reuse churn, not to promise that many processes
/// can be alive simultaneously.
pub const MAX_PROCESSES: usize = MAX_THREADS;

/// Maximum children tracked per process before `fork` starts failing.
pub const MAX_CHILDREN: usize = 64;

/// Maximum threads tracked per process (beyond the main thread).
pub const MAX_PROCESS_THREADS: usize = 32;

/// Maximum bytes of a process name, not including a terminator.
pub const MAX_NAME_LEN: usize = 32;

/// POSIX-style credential set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self {
        uid: 0,
        euid: 0,
        suid: 0,
        gid: 0,
        egid: 0,
        sgid: 0,
    };
}

/// A process: the unit of address-space and credential ownership.
///
/// Kernel-only processes (created via `kthread_create`) have no address
/// space (`address_space_root = None`).
pub struct Process {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub pgid: Pid,
    pub sid: Pid,
    pub creds: Credentials,
    /// Physical address of this process's PML4, if it owns a user address
    /// space. `None` for kernel-only processes, which run entirely in the
    /// kernel's own address space.
    pub address_space_root: Option<u64>,
    pub main_thread: Tid,
    threads: [Option<Tid>; MAX_PROCESS_THREADS],
    thread_count: usize,
    children: [Option<Pid>; MAX_CHILDREN],
    child_count: usize,
    pub exit_code: i32,
    pub zombie: bool,
    name: [u8; MAX_NAME_LEN],
    name_len: usize,
    /// Capability slots this process holds: endpoint and notification
    /// handles, each gated by its own rights mask. IPC syscalls take a
    /// slot index into this table, never a raw endpoint id.
    pub capability_space: CapabilitySpace,
}

/// Errors from process-table and process-tree operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// The process table is full, or `pid` doesn't fit in it.
    TableFull,
    /// No process with that PID is registered.
    NoSuchProcess,
    /// The process's child list is full.
    TooManyChildren,
    /// The process's thread list is full.
    TooManyThreads,
    /// The calling process has no children to wait for.
    NoChildren,
}

impl Process {
    pub fn new(pid: Pid, ppid: Option<Pid>, main_thread: Tid, name: &str) -> Self {
        let mut name_buf = [0u8; MAX_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_LEN);
        name_buf[..len].copy_from_slice(&bytes[..len]);

        Self {
            pid,
            ppid,
            pgid: pid,
            sid: pid,
            creds: Credentials::ROOT,
            address_space_root: None,
            main_thread,
            threads: [None; MAX_PROCESS_THREADS],
            thread_count: 0,
            children: [None; MAX_CHILDREN],
            child_count: 0,
            exit_code: 0,
            zombie: false,
            name: name_buf,
            name_len: len,
            capability_space: CapabilitySpace::new(),
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }

    pub fn children(&self) -> impl Iterator<Item = Pid> + '_ {
        self.children.iter().filter_map(|c| *c)
    }

    pub fn add_child(&mut self, child: Pid) -> Result<(), ProcessError> {
        for slot in self.children.iter_mut() {
            if slot.is_none() {
                *slot = Some(child);
                self.child_count += 1;
                return Ok(());
            }
        }
        Err(ProcessError::TooManyChildren)
    }

    pub fn remove_child(&mut self, child: Pid) {
        for slot in self.children.iter_mut() {
            if *slot == Some(child) {
                *slot = None;
                self.child_count -= 1;
                return;
            }
        }
    }

    pub fn has_children(&self) -> bool {
        self.child_count > 0
    }

    pub fn add_thread(&mut self, tid: Tid) -> Result<(), ProcessError> {
        for slot in self.threads.iter_mut() {
            if slot.is_none() {
                *slot = Some(tid);
                self.thread_count += 1;
                return Ok(());
            }
        }
        Err(ProcessError::TooManyThreads)
    }

    pub fn remove_thread(&mut self, tid: Tid) {
        for slot in self.threads.iter_mut() {
            if *slot == Some(tid) {
                *slot = None;
                self.thread_count -= 1;
                return;
            }
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

/// A fixed-capacity arena of [`Process`] records indexed by PID.
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Inserts `process` at the slot given by its own PID.
    pub fn insert(&mut self, process: Process) -> Result<(), ProcessError> {
        let idx = process.pid.as_u32() as usize;
        let slot = self.slots.get_mut(idx).ok_or(ProcessError::TableFull)?;
        if slot.is_some() {
            return Err(ProcessError::TableFull);
        }
        *slot = Some(process);
        Ok(())
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.slots.get_mut(pid.as_u32() as usize)?.take()
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_u32() as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_u32() as usize)?.as_mut()
    }

    /// Reassigns every child of `from` to `to`, leaving `from`'s child list
    /// empty. Used by `exit()` to reparent orphans to init.
    pub fn reparent_children(&mut self, from: Pid, to: Pid) {
        let mut child_pids = [None; MAX_CHILDREN];
        if let Some(p) = self.get_mut(from) {
            child_pids = p.children;
            p.children = [None; MAX_CHILDREN];
            p.child_count = 0;
        }
        for child in child_pids.into_iter().flatten() {
            if let Some(c) = self.get_mut(child) {
                c.ppid = Some(to);
            }
            if let Some(init) = self.get_mut(to) {
                let _ = init.add_child(child);
            }
        }
    }

    /// Finds a zombie child of `parent`, if any.
    pub fn find_zombie_child(&self, parent: Pid) -> Option<Pid> {
        let p = self.get(parent)?;
        p.children().find(|&c| self.get(c).is_some_and(|cp| cp.zombie))
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(pid: u32, ppid: Option<u32>) -> Process {
        Process::new(Pid::new(pid), ppid.map(Pid::new), Tid::new(pid), "test")
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut table = ProcessTable::new();
        table.insert(p(1, None)).unwrap();
        assert_eq!(table.get(Pid::new(1)).unwrap().pid, Pid::new(1));
    }

    #[test]
    fn double_insert_at_same_pid_fails() {
        let mut table = ProcessTable::new();
        table.insert(p(1, None)).unwrap();
        assert_eq!(table.insert(p(1, None)), Err(ProcessError::TableFull));
    }

    #[test]
    fn reparent_moves_every_child_to_init() {
        let mut table = ProcessTable::new();
        table.insert(p(1, None)).unwrap(); // init
        table.insert(p(2, Some(1))).unwrap(); // parent
        table.insert(p(3, Some(2))).unwrap(); // child
        table.get_mut(Pid::new(2)).unwrap().add_child(Pid::new(3)).unwrap();

        table.reparent_children(Pid::new(2), Pid::new(1));

        assert_eq!(table.get(Pid::new(3)).unwrap().ppid, Some(Pid::new(1)));
        assert!(table.get(Pid::new(1)).unwrap().children().any(|c| c == Pid::new(3)));
        assert!(!table.get(Pid::new(2)).unwrap().has_children());
    }

    #[test]
    fn find_zombie_child_locates_the_right_pid() {
        let mut table = ProcessTable::new();
        table.insert(p(1, None)).unwrap();
        table.insert(p(2, Some(1))).unwrap();
        table.get_mut(Pid::new(1)).unwrap().add_child(Pid::new(2)).unwrap();
        assert!(table.find_zombie_child(Pid::new(1)).is_none());

        table.get_mut(Pid::new(2)).unwrap().zombie = true;
        assert_eq!(table.find_zombie_child(Pid::new(1)), Some(Pid::new(2)));
    }
}
