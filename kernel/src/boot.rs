//! Kernel entry glue: the bootloader-agnostic [`BootInfo`] contract, global
//! subsystem state, and the staged bring-up sequence [`kernel_init`] drives
//! to get from "bootloader handoff" to "scheduler running init".
//!
//! Mirrors the shape of a Limine-style handoff (a read-only memory map plus
//! a handful of scalar facts) without depending on any particular
//! bootloader crate; [`crate::main`] (the actual `_start`) is the only
//! place that has to know what bootloader built the concrete [`BootInfo`]
//! implementation it passes in here.

use ferrite_core::addr::{PhysAddr, VirtAddr};
use ferrite_core::arch::x86_64::registers::control::Cr3;
use ferrite_core::arch::x86_64::structures::paging::PageFaultErrorCode;
use ferrite_core::arch::x86_64::syscall::SyscallCallerState;
use ferrite_core::error::Errno;
use ferrite_core::id::{EndpointId, Pid, Tid};
use ferrite_core::paging::{PhysFrame, Size4KiB};
use ferrite_core::percpu;
use ferrite_core::sync::{LazyLock, SpinLock};
use ferrite_mm::address_space::{AddressSpace, VmaFlags};
use ferrite_mm::arch::x86_64::PageTableMapper;
use ferrite_mm::buddy::{self, BuddyFrameAllocRef};
use ferrite_mm::vmm::{KernelStack, Vmm};
use ferrite_mm::{FrameDeallocator, PhysMemoryRegion};
use ferrite_sched::sched::Scheduler;
use ferrite_sched::thread::{DEFAULT_PRIORITY, Thread, ThreadFlags, ThreadState};
use planck_noalloc::vec::ArrayVec;

use crate::arch::x86_64::{gdt, pic};
use crate::process::{Process, ProcessTable};

/// Upper bound on memory-map entries read out of the bootloader handoff.
pub const MAX_MEMORY_REGIONS: usize = 256;

/// Bootloader-agnostic facts [`kernel_init`] needs to bring the machine up.
///
/// Deliberately narrower than a typical bootloader protocol struct: no
/// framebuffer, no SMP topology, no initrd. This kernel core boots a single
/// CPU far enough to hand off to `init` over IPC; anything a framebuffer
/// console, another CPU, or a ramdisk would provide belongs to a process
/// reached that way, not to this struct.
pub trait BootInfo {
    /// Usable and reserved physical memory regions, as reported by the
    /// bootloader.
    fn memory_map(&self) -> ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS>;
    /// Offset of the higher-half direct map.
    fn hhdm_offset(&self) -> u64;
    /// Physical address of the bootloader-built PML4 this kernel should
    /// keep using (its upper half is copied into every user address
    /// space).
    fn page_table_root(&self) -> PhysAddr;
    /// Highest physical address reported anywhere in the memory map.
    fn max_physical_address(&self) -> u64;
    /// Physical address of the ACPI RSDP, if the bootloader found one.
    fn rsdp_address(&self) -> Option<PhysAddr>;
    /// The kernel command line, if the bootloader passed one through.
    fn command_line(&self) -> Option<&str>;
}

/// A concrete, owned [`BootInfo`]. [`crate::main`] fills one of these in
/// from whatever bootloader protocol it was actually handed and passes it
/// to [`kernel_init`] by reference.
#[derive(Clone)]
pub struct BootInfoData {
    /// See [`BootInfo::memory_map`].
    pub memory_map: ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS>,
    /// See [`BootInfo::hhdm_offset`].
    pub hhdm_offset: u64,
    /// See [`BootInfo::page_table_root`].
    pub page_table_root: PhysAddr,
    /// See [`BootInfo::max_physical_address`].
    pub max_physical_address: u64,
    /// See [`BootInfo::rsdp_address`].
    pub rsdp_address: Option<PhysAddr>,
    /// See [`BootInfo::command_line`]. Fixed-size since this struct carries
    /// no allocator-backed storage.
    pub command_line: Option<&'static str>,
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS> {
        self.memory_map.clone()
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn page_table_root(&self) -> PhysAddr {
        self.page_table_root
    }

    fn max_physical_address(&self) -> u64 {
        self.max_physical_address
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }

    fn command_line(&self) -> Option<&str> {
        self.command_line
    }
}

/// Upper bound on live processes; matches the thread table so every
/// process can have at least one thread.
const MAX_PROCESSES: usize = ferrite_sched::thread::MAX_THREADS;
/// Upper bound on live endpoints system-wide.
const MAX_ENDPOINTS: usize = 256;
/// TID reserved for the idle "thread" (really this CPU's boot-flow resume
/// point; see [`spawn_idle`]).
const IDLE_TID: u32 = 0;
/// Bootstrap syscall/early stack size, mirrored from
/// `ferrite_core::percpu`'s private constant so the idle thread record can
/// describe the stack it's actually running on.
const EARLY_SYSCALL_STACK_SIZE: usize = 16384;
/// Default user stack size for a freshly exec'd process: 16 pages.
const USER_STACK_SIZE: u64 = 16 * 4096;
/// Maximum `argv`/`envp` entries `exec()` will copy in from the caller.
const MAX_EXEC_ARGS: usize = 8;
/// Maximum bytes (including the NUL) of a single `argv`/`envp` string.
const MAX_EXEC_ARG_LEN: usize = 64;

/// The global scheduler. `ferrite_core::arch::x86_64::switch_context` is
/// wired in directly; nothing about scheduling policy depends on it beyond
/// "call this to swap register state".
static SCHEDULER: Scheduler = Scheduler::new(ferrite_core::arch::x86_64::switch_context);

/// The kernel's own address space (heap + stacks + MMIO regions), shared
/// read-only into every user [`AddressSpace`]'s upper half. `None` until
/// [`init_kernel_vmm`] runs.
static KERNEL_VMM: SpinLock<Option<Vmm<PageTableMapper>>> = SpinLock::new(None);

/// Guarded kernel stacks, one per live thread, kept alive here so their
/// `Drop` impl (which frees the stack's virtual range) doesn't run until a
/// thread is reaped. Indexed by `tid.as_u32()`.
static KERNEL_STACKS: LazyLock<SpinLock<[Option<KernelStack>; ferrite_sched::thread::MAX_THREADS]>> =
    LazyLock::new(|| SpinLock::new(core::array::from_fn(|_| None)));

/// Every live process.
static PROCESS_TABLE: LazyLock<SpinLock<ProcessTable>> = LazyLock::new(|| SpinLock::new(ProcessTable::new()));

/// Which process owns each live thread, indexed by `tid.as_u32()`.
/// `ferrite_sched::thread::Thread` itself carries a `pid` field, but the
/// scheduler doesn't expose thread records outside `ferrite-sched`, so
/// `boot`/`runtime` keeps its own reverse index instead.
static THREAD_OWNER: LazyLock<SpinLock<[Option<Pid>; ferrite_sched::thread::MAX_THREADS]>> =
    LazyLock::new(|| SpinLock::new(core::array::from_fn(|_| None)));

/// Looks up the process owning `tid`.
fn pid_for_tid(tid: Tid) -> Option<Pid> {
    THREAD_OWNER.lock()[tid.as_u32() as usize]
}

/// Per-process user address spaces, indexed by PID.
static ADDRESS_SPACES: LazyLock<SpinLock<[Option<AddressSpace<PageTableMapper>>; MAX_PROCESSES]>> =
    LazyLock::new(|| SpinLock::new(core::array::from_fn(|_| None)));

/// Every live endpoint, indexed by `EndpointId`. IPC handles are direct
/// table indices for this syscall ABI's fast path (no capability-space
/// indirection yet; see `DESIGN.md`).
static ENDPOINTS: LazyLock<SpinLock<[Option<ferrite_ipc::Endpoint>; MAX_ENDPOINTS]>> =
    LazyLock::new(|| SpinLock::new(core::array::from_fn(|_| None)));

/// Next endpoint id to hand out.
static NEXT_ENDPOINT: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1);

/// The bootloader-built PML4 every user [`AddressSpace`]'s upper half is
/// copied from. Set once in [`kernel_init`]; read by `fork`/`exec` when
/// building a fresh address space.
static KERNEL_ROOT: SpinLock<Option<PhysAddr>> = SpinLock::new(None);

/// Per-syscall caller state stashed by `syscall_entry`'s assembly, read
/// back when `fork()` needs to know the user RIP/RSP/RFLAGS the parent was
/// interrupted at. Single instance: `MAX_CPUS == 1`.
static mut SYSCALL_CALLER_STATE: SyscallCallerState = SyscallCallerState::new();

/// Runs `f` with exclusive access to the physical frame allocator, wrapped
/// as a [`ferrite_mm::FrameAllocator`]/[`ferrite_mm::FrameDeallocator`].
fn with_alloc<R>(f: impl FnOnce(&mut BuddyFrameAllocRef<'_>) -> R) -> R {
    buddy::with(|pmm| f(&mut BuddyFrameAllocRef(pmm)))
}

/// Frees a single user-owned 4 KiB frame. Matches
/// [`ferrite_mm::address_space::FrameDeallocFn`]'s signature so it can be
/// handed to [`AddressSpace::new_user`] directly.
fn dealloc_user_frame(frame: PhysFrame<Size4KiB>) {
    buddy::with(|pmm| unsafe { BuddyFrameAllocRef(pmm).deallocate_frame(frame) });
}

/// Unmaps and frees every VMA-backing frame in `space` before it is dropped.
///
/// `AddressSpace::drop` only frees the PML4 frame itself; callers own
/// freeing everything `unmap_region` would otherwise need to, per its own
/// doc comment. Every place that discards a live `AddressSpace` (process
/// exit reaping, `exec`'s replacement of the caller's own space) must run
/// this first or its user pages leak back to the PMM permanently.
fn free_address_space(space: &mut AddressSpace<PageTableMapper>) {
    // Matches `ferrite_mm::address_space`'s own (private) `MAX_VMAS` cap;
    // a snapshot is needed because `unmap_region` mutates `space.areas()`
    // while we'd still be iterating it.
    const MAX_VMAS: usize = 128;
    let mut areas: [Option<(VirtAddr, u64)>; MAX_VMAS] = [None; MAX_VMAS];
    let mut count = 0;
    for area in space.areas() {
        if count >= areas.len() {
            break;
        }
        areas[count] = Some((area.start, area.end.as_u64() - area.start.as_u64()));
        count += 1;
    }
    for entry in areas[..count].iter().flatten() {
        let (start, size) = *entry;
        let _ = with_alloc(|alloc| space.unmap_region(start, size, alloc));
    }
}

/// Points the GDT/TSS and per-CPU kernel-RSP slot at `top`, and loads CR3 if
/// `root` differs from what's already active. Called on every switch into a
/// thread that runs (or might trap back into the kernel while running) with
/// this kernel stack.
fn fixup_kernel_stack(top: VirtAddr, root: PhysAddr) {
    gdt::set_kernel_stack(top.as_u64());
    unsafe { percpu::set_kernel_rsp(top.as_u64()) };
    if Cr3::read() != root {
        // SAFETY: `root` is a live PML4 (either the kernel's own or a
        // process's `AddressSpace`, both of which keep the kernel upper
        // half mapped identically).
        unsafe { Cr3::write(root) };
    }
}

/// Brings up the PMM, the kernel's own heap/stacks address space, the
/// scheduler's idle slot, and `init`, then hands off to the scheduler
/// forever.
///
/// # Safety
///
/// Must be called exactly once, as the very first Rust code after the
/// bootloader handoff, with interrupts disabled.
pub unsafe fn kernel_init(boot_info: &impl BootInfo) -> ! {
    ferrite_core::kinfo!("ferrite: starting");

    ferrite_mm::hhdm::init(boot_info.hhdm_offset());

    let regions = boot_info.memory_map();
    buddy::init(regions.as_slice(), boot_info.hhdm_offset());
    ferrite_core::kinfo!(
        "pmm: {} frames free",
        buddy::with(|pmm| pmm.free_frames())
    );

    let kernel_root = boot_info.page_table_root();
    *KERNEL_ROOT.lock() = Some(kernel_root);
    let mapper = PageTableMapper::new(boot_info.hhdm_offset());
    let mut vmm = Vmm::new(kernel_root, mapper, boot_info.hhdm_offset(), boot_info.max_physical_address());
    with_alloc(|alloc| vmm.map_initial_heap(alloc)).expect("failed to map initial kernel heap");

    let idle_stack = with_alloc(|alloc| vmm.alloc_kernel_stack(alloc, None)).expect("failed to allocate idle kernel stack");
    let idle_top = idle_stack.top();
    *KERNEL_VMM.lock() = Some(vmm);

    // SAFETY: called once, before interrupts are enabled and before any
    // syscall can fire.
    unsafe {
        gdt::init(idle_top.as_u64());
        percpu::init_gs_base();
        crate::arch::x86_64::idt::init();
        pic::remap_and_mask();
        crate::arch::x86_64::pit::init();
        ferrite_core::arch::x86_64::syscall::init();
        percpu::set_scratch(core::ptr::addr_of!(SYSCALL_CALLER_STATE) as u64);
        crate::arch::x86_64::serial::init();
    }

    // `idle_stack`'s guard range must stay reserved for as long as this CPU
    // might run on it; parked here for the kernel's lifetime rather than
    // freed, since nothing ever tears down the idle thread.
    core::mem::forget(idle_stack);

    spawn_idle(idle_top);

    match crate::elf::find_embedded("init") {
        Some(image) => spawn_init(image, kernel_root),
        None => ferrite_core::kwarn!("boot: no embedded init binary; booting with no user processes"),
    }

    // SAFETY: IDT, PIC, and PIT are all programmed; safe to start taking
    // interrupts.
    unsafe { ferrite_core::arch::x86_64::instructions::interrupts::enable() };

    ferrite_core::kinfo!("ferrite: entering scheduler");

    // From here on, this call site *is* the idle thread: `set_idle` has
    // already made the idle TID `rq.current`, so the very first
    // `schedule()` call below saves this function's own resume point into
    // the idle thread's context record, and `switch_context`'s `jmp`/`ret`
    // pairing makes every future switch back to idle return right back
    // here. The hand-built idle context computed in `spawn_idle` is a
    // momentary placeholder, overwritten the instant this loop starts.
    loop {
        SCHEDULER.schedule();
        if SCHEDULER.nr_running() <= 1 {
            // SAFETY: interrupts are enabled, IDT is live; a pending timer
            // or keyboard IRQ wakes this CPU back up.
            unsafe { ferrite_core::arch::x86_64::instructions::interrupts::enable_and_hlt() };
        }
    }
}

/// Registers TID 0 as the scheduler's idle slot. Its hand-built context is
/// never actually entered in practice (see [`kernel_init`]'s closing
/// comment) but gives the scheduler a valid record to requeue against
/// before the first real switch happens.
fn spawn_idle(kernel_stack_top: VirtAddr) {
    let base = kernel_stack_top.as_u64() + 8 - EARLY_SYSCALL_STACK_SIZE as u64;
    let mut idle = Thread::new(Tid::new(IDLE_TID), Pid::new(0), TIMESHARE_IDLE_PRIORITY, base, EARLY_SYSCALL_STACK_SIZE);
    idle.flags = ThreadFlags::IDLE | ThreadFlags::KTHREAD;
    idle.state = ThreadState::Running;
    SCHEDULER.set_idle(idle).expect("failed to install idle thread");
}

/// Lowest scheduling priority: idle only ever runs when nothing else is
/// runnable.
const TIMESHARE_IDLE_PRIORITY: u8 = ferrite_sched::thread::TIMESHARE_PRIORITY_MAX;

/// Builds the `init` process from an embedded ELF image and adds it to the
/// scheduler's run queue. `init`'s PID/TID are whatever the bitmaps hand
/// out first (not hardcoded to 1), since nothing downstream depends on a
/// specific numeric value.
fn spawn_init(image: &'static [u8], kernel_root: PhysAddr) {
    let pid = crate::pid::alloc().expect("pid space exhausted during boot");
    let tid = crate::tid::alloc().expect("tid space exhausted during boot");

    let mapper = PageTableMapper::new(ferrite_mm::hhdm::offset());
    let mut space = with_alloc(|alloc| unsafe {
        AddressSpace::new_user(kernel_root, mapper, ferrite_mm::hhdm::offset(), alloc, dealloc_user_frame)
    })
    .expect("failed to create init's address space");

    let loaded = with_alloc(|alloc| crate::elf::load(&mut space, image, alloc)).expect("failed to load init image");

    let user_stack_top = with_alloc(|alloc| {
        space.mmap(
            VirtAddr::zero(),
            USER_STACK_SIZE,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANONYMOUS | VmaFlags::STACK,
            alloc,
        )
    })
    .expect("failed to map init's user stack")
        + USER_STACK_SIZE;
    let user_rsp = VirtAddr::new_truncate(user_stack_top.as_u64() & !0xF);

    let kernel_stack = with_alloc(|alloc| {
        KERNEL_VMM
            .lock()
            .as_mut()
            .expect("kernel VMM not initialized")
            .alloc_kernel_stack(alloc, Some(free_thread_stack))
    })
    .expect("failed to allocate init's kernel stack");
    let kernel_stack_top = kernel_stack.top();

    // SAFETY: kernel_stack_top is freshly allocated, mapped, and owned
    // exclusively by this thread.
    let context = unsafe { crate::arch::x86_64::entry::build_user_entry_context(kernel_stack_top, loaded.entry, user_rsp, 0) };

    let mut thread = Thread::new(tid, pid, DEFAULT_PRIORITY, kernel_stack.bottom().as_u64(), KERNEL_STACK_SIZE_BYTES);
    thread.context = context;
    thread.user_rsp = user_rsp.as_u64();
    thread.state = ThreadState::Running;

    KERNEL_STACKS.lock()[tid.as_u32() as usize] = Some(kernel_stack);
    ADDRESS_SPACES.lock()[pid.as_u32() as usize] = Some(space);
    THREAD_OWNER.lock()[tid.as_u32() as usize] = Some(pid);
    PROCESS_TABLE
        .lock()
        .insert(Process::new(pid, None, tid, "init"))
        .expect("process table full during boot");

    SCHEDULER.spawn(thread).expect("failed to spawn init thread");
    ferrite_core::kinfo!("boot: spawned init as pid {} tid {}", pid.as_u32(), tid.as_u32());
}

/// Matches [`ferrite_mm::vmm::Vmm::alloc_kernel_stack`]'s 64 KiB + guard
/// page convention.
const KERNEL_STACK_SIZE_BYTES: usize = 64 * 1024;

/// [`ferrite_mm::vmm::StackCleanupFn`] for a reaped thread's kernel stack:
/// frees its guarded virtual range back to the kernel VMM's stacks region.
fn free_thread_stack(guard: VirtAddr, _bottom: VirtAddr, _top: VirtAddr) {
    if let Some(vmm) = KERNEL_VMM.lock().as_mut() {
        let _ = vmm.dealloc_stack_region(guard);
    }
}

/// Runtime hooks called from [`crate::syscall::syscall_dispatch`] and
/// `kernel::arch::x86_64::idt`'s trap handlers. Each function here is the
/// one place that actually knows about the global process/thread/endpoint
/// tables declared above; everything above the syscall table only sees a
/// flat `nr, a0..a4 -> isize` ABI.
pub mod runtime {
    use super::*;

    /// Returns the [`Pid`] owning the currently running thread.
    fn current_process_pid() -> Option<Pid> {
        let tid = SCHEDULER.current()?;
        super::pid_for_tid(tid)
    }

    /// Terminates the current thread and, if it was its process's last
    /// thread, the process itself: reparents any children to PID 1,
    /// records the exit code, and marks the process a zombie for `wait()`
    /// to reap. Never returns; the scheduler's `exit_current` discards this
    /// thread's saved context permanently.
    pub fn exit_current(code: i32) -> ! {
        let tid = SCHEDULER.current().expect("exit_current: no current thread");
        if let Some(pid) = super::pid_for_tid(tid) {
            let mut table = PROCESS_TABLE.lock();
            if let Some(process) = table.get_mut(pid) {
                process.remove_thread(tid);
                if process.thread_count() == 0 {
                    process.exit_code = code;
                    process.zombie = true;
                    let init_pid = Pid::new(1);
                    if pid != init_pid {
                        table.reparent_children(pid, init_pid);
                    }
                }
            }
        }
        SCHEDULER.exit_current();
        unreachable!("exit_current: scheduler switched away from an exited thread");
    }

    /// Duplicates the calling thread's process: a fresh PID/TID, a
    /// copy-on-write address space, and a thread whose saved context
    /// resumes exactly where the parent's `SYSCALL` trapped, seeing 0 in
    /// RAX. Does not call [`ferrite_core::arch::x86_64::switch_context`]
    /// directly — the child is simply handed to the scheduler as an
    /// independent runnable thread, exactly like `spawn_init`'s thread.
    pub fn fork_current() -> isize {
        let Some(parent_tid) = SCHEDULER.current() else {
            return Errno::InvalidArgument.to_retval();
        };
        let Some(parent_pid) = super::pid_for_tid(parent_tid) else {
            return Errno::InvalidArgument.to_retval();
        };

        let Some(child_pid) = crate::pid::alloc() else {
            return Errno::OutOfMemory.to_retval();
        };
        let Some(child_tid) = crate::tid::alloc() else {
            crate::pid::free(child_pid);
            return Errno::OutOfMemory.to_retval();
        };

        let kernel_root = KERNEL_ROOT.lock().expect("kernel root not initialized");

        let mapper = PageTableMapper::new(ferrite_mm::hhdm::offset());
        let mut child_space = match with_alloc(|alloc| unsafe {
            AddressSpace::new_user(kernel_root, mapper, ferrite_mm::hhdm::offset(), alloc, dealloc_user_frame)
        }) {
            Ok(space) => space,
            Err(_) => {
                crate::tid::free(child_tid);
                crate::pid::free(child_pid);
                return Errno::OutOfMemory.to_retval();
            }
        };

        {
            let mut spaces = ADDRESS_SPACES.lock();
            let Some(parent_space) = spaces[parent_pid.as_u32() as usize].as_mut() else {
                crate::tid::free(child_tid);
                crate::pid::free(child_pid);
                return Errno::InvalidArgument.to_retval();
            };
            if parent_space.clone_into_cow(&mut child_space).is_err() {
                crate::tid::free(child_tid);
                crate::pid::free(child_pid);
                return Errno::OutOfMemory.to_retval();
            }
        }

        // SAFETY: SYSCALL_CALLER_STATE was populated by this very syscall's
        // entry trampoline before `syscall_dispatch` ran.
        let caller = unsafe { core::ptr::read(core::ptr::addr_of!(SYSCALL_CALLER_STATE)) };

        let kernel_stack = match with_alloc(|alloc| {
            KERNEL_VMM
                .lock()
                .as_mut()
                .expect("kernel VMM not initialized")
                .alloc_kernel_stack(alloc, Some(free_thread_stack))
        }) {
            Ok(stack) => stack,
            Err(_) => {
                crate::tid::free(child_tid);
                crate::pid::free(child_pid);
                return Errno::OutOfMemory.to_retval();
            }
        };
        let kernel_stack_top = kernel_stack.top();
        let entry = VirtAddr::new_truncate(caller.rip);
        let user_rsp = VirtAddr::new_truncate(caller.rsp);

        // SAFETY: kernel_stack_top is freshly allocated and exclusively
        // owned by the child thread.
        let context = unsafe { crate::arch::x86_64::entry::build_user_entry_context(kernel_stack_top, entry, user_rsp, 0) };

        let mut child_thread = Thread::new(
            child_tid,
            child_pid,
            DEFAULT_PRIORITY,
            kernel_stack.bottom().as_u64(),
            KERNEL_STACK_SIZE_BYTES,
        );
        child_thread.context = context;
        child_thread.user_rsp = user_rsp.as_u64();
        child_thread.state = ThreadState::Running;

        KERNEL_STACKS.lock()[child_tid.as_u32() as usize] = Some(kernel_stack);
        ADDRESS_SPACES.lock()[child_pid.as_u32() as usize] = Some(child_space);
        THREAD_OWNER.lock()[child_tid.as_u32() as usize] = Some(child_pid);
        if PROCESS_TABLE
            .lock()
            .insert(Process::new(child_pid, Some(parent_pid), child_tid, "fork"))
            .is_err()
        {
            return Errno::OutOfMemory.to_retval();
        }
        if let Some(parent) = PROCESS_TABLE.lock().get_mut(parent_pid) {
            let _ = parent.add_child(child_pid);
        }

        if SCHEDULER.spawn(child_thread).is_err() {
            return Errno::OutOfMemory.to_retval();
        }

        child_pid.as_u32() as isize
    }

    /// Replaces the calling thread's user image in place: loads a fresh
    /// ELF into a brand-new address space, swaps it in for the caller's
    /// current one, and jumps directly to the new entry point. Unlike
    /// `fork`, this calls
    /// [`ferrite_core::arch::x86_64::switch_context`] directly with a
    /// discarded `prev`: the calling thread's old register state is
    /// meaningless once its address space is gone, so there's nothing to
    /// save it for.
    pub fn exec_current(path_ptr: usize, argv_ptr: usize, envp_ptr: usize) -> isize {
        let Some(tid) = SCHEDULER.current() else {
            return Errno::InvalidArgument.to_retval();
        };
        let Some(pid) = super::pid_for_tid(tid) else {
            return Errno::InvalidArgument.to_retval();
        };

        let mut path_buf = [0u8; 256];
        let mut argv_bytes = [0u8; MAX_EXEC_ARGS * MAX_EXEC_ARG_LEN];
        let mut argv_lens = [0usize; MAX_EXEC_ARGS];
        let mut argc = 0usize;
        let mut envp_bytes = [0u8; MAX_EXEC_ARGS * MAX_EXEC_ARG_LEN];
        let mut envp_lens = [0usize; MAX_EXEC_ARGS];
        let mut envc = 0usize;

        let path_len = {
            let spaces = ADDRESS_SPACES.lock();
            let Some(space) = spaces[pid.as_u32() as usize].as_ref() else {
                return Errno::InvalidArgument.to_retval();
            };
            let path_len = match space.copy_user_cstring(VirtAddr::new_truncate(path_ptr as u64), &mut path_buf) {
                Ok(len) => len,
                Err(_) => return Errno::BadAddress.to_retval(),
            };
            if let Err(retval) = copy_user_string_array(space, argv_ptr, &mut argv_bytes, &mut argv_lens, &mut argc) {
                return retval;
            }
            if let Err(retval) = copy_user_string_array(space, envp_ptr, &mut envp_bytes, &mut envp_lens, &mut envc) {
                return retval;
            }
            path_len
        };
        let path = core::str::from_utf8(&path_buf[..path_len]).unwrap_or("");

        let Some(image) = crate::elf::find_embedded(path) else {
            return Errno::NoSuchEntry.to_retval();
        };

        let kernel_root = KERNEL_ROOT.lock().expect("kernel root not initialized");
        let mapper = PageTableMapper::new(ferrite_mm::hhdm::offset());
        let mut new_space = match with_alloc(|alloc| unsafe {
            AddressSpace::new_user(kernel_root, mapper, ferrite_mm::hhdm::offset(), alloc, dealloc_user_frame)
        }) {
            Ok(space) => space,
            Err(_) => return Errno::OutOfMemory.to_retval(),
        };

        let loaded = match with_alloc(|alloc| crate::elf::load(&mut new_space, image, alloc)) {
            Ok(loaded) => loaded,
            Err(_) => return Errno::BadAddress.to_retval(),
        };

        let user_stack_top = match with_alloc(|alloc| {
            new_space.mmap(
                VirtAddr::zero(),
                USER_STACK_SIZE,
                VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANONYMOUS | VmaFlags::STACK,
                alloc,
            )
        }) {
            Ok(base) => base + USER_STACK_SIZE,
            Err(_) => return Errno::OutOfMemory.to_retval(),
        };
        let user_rsp = build_exec_stack(
            &new_space,
            user_stack_top,
            &argv_bytes,
            &argv_lens,
            argc,
            &envp_bytes,
            &envp_lens,
            envc,
        );

        let new_root = new_space.root_phys();
        {
            let mut spaces = ADDRESS_SPACES.lock();
            if let Some(mut old_space) = spaces[pid.as_u32() as usize].take() {
                free_address_space(&mut old_space);
            }
            spaces[pid.as_u32() as usize] = Some(new_space);
        }

        let kernel_stack_top = KERNEL_STACKS.lock()[tid.as_u32() as usize]
            .as_ref()
            .map(|s| s.top())
            .unwrap_or_else(|| VirtAddr::new_truncate(percpu::early_kernel_rsp()));

        fixup_kernel_stack(kernel_stack_top, new_root);

        // SAFETY: kernel_stack_top belongs to this thread's own, currently
        // active kernel stack (just fixed up above).
        let new_context = unsafe { crate::arch::x86_64::entry::build_user_entry_context(kernel_stack_top, loaded.entry, user_rsp, 0) };

        let mut discarded_prev = ferrite_core::arch::x86_64::CpuContext::default();
        // SAFETY: new_context was just built for a freshly loaded image on
        // this thread's own kernel stack; this call never returns.
        unsafe {
            ferrite_core::arch::x86_64::switch_context(&mut discarded_prev as *mut _, &new_context as *const _);
        }
        unreachable!("exec_current: switch_context does not return");
    }

    /// Copies a NUL-terminated, NULL-terminated array of C string pointers
    /// (`argv`/`envp` shape) out of `space` into fixed-capacity local
    /// storage. `array_ptr == 0` is treated as an empty array. Stops at the
    /// first NULL entry or at [`MAX_EXEC_ARGS`], whichever comes first.
    fn copy_user_string_array(
        space: &AddressSpace<PageTableMapper>,
        array_ptr: usize,
        bytes: &mut [u8; MAX_EXEC_ARGS * MAX_EXEC_ARG_LEN],
        lens: &mut [usize; MAX_EXEC_ARGS],
        count: &mut usize,
    ) -> Result<(), isize> {
        if array_ptr == 0 {
            return Ok(());
        }
        for i in 0..MAX_EXEC_ARGS {
            let entry_addr = VirtAddr::new_truncate(array_ptr as u64 + (i * 8) as u64);
            if !space.validate_user_range(entry_addr, 8, VmaFlags::READ) {
                return Err(Errno::BadAddress.to_retval());
            }
            // SAFETY: validated above.
            let str_ptr = unsafe { core::ptr::read(entry_addr.as_ptr::<u64>()) };
            if str_ptr == 0 {
                return Ok(());
            }
            let slot = &mut bytes[i * MAX_EXEC_ARG_LEN..(i + 1) * MAX_EXEC_ARG_LEN];
            match space.copy_user_cstring(VirtAddr::new_truncate(str_ptr), slot) {
                Ok(len) => {
                    lens[i] = len;
                    *count += 1;
                }
                Err(_) => return Err(Errno::BadAddress.to_retval()),
            }
        }
        Ok(())
    }

    /// Writes one `u64` into `space`'s backing frame for `addr` through the
    /// HHDM. `space` need not be the currently active address space;
    /// `map_region` eagerly backs every page of a fresh `mmap` with a real
    /// frame, so every stack address built here already translates.
    fn write_user_u64(space: &AddressSpace<PageTableMapper>, addr: VirtAddr, value: u64) {
        let phys = space.translate(addr).expect("exec stack page not mapped");
        let dst = (ferrite_mm::hhdm::offset() + phys.as_u64()) as *mut u64;
        // SAFETY: phys was just mapped by `mmap` for this exact address.
        unsafe { core::ptr::write_unaligned(dst, value) };
    }

    /// Writes `data` starting at `addr` into `space` through the HHDM.
    fn write_user_bytes(space: &AddressSpace<PageTableMapper>, addr: VirtAddr, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            let a = VirtAddr::new_truncate(addr.as_u64() + i as u64);
            let phys = space.translate(a).expect("exec stack page not mapped");
            let dst = (ferrite_mm::hhdm::offset() + phys.as_u64()) as *mut u8;
            // SAFETY: phys was just mapped by `mmap` for this exact address.
            unsafe { core::ptr::write(dst, b) };
        }
    }

    /// Builds the initial user stack image for a freshly exec'd image:
    /// from `stack_top` down, the auxiliary vector terminator, `envp`
    /// string bytes, `argv` string bytes, padding to 16-byte alignment,
    /// the `envp` pointer array (NULL-terminated), the `argv` pointer
    /// array (NULL-terminated), then `argc` — the System V AMD64
    /// process-entry contract. Returns the resulting stack pointer.
    #[allow(clippy::too_many_arguments)]
    fn build_exec_stack(
        space: &AddressSpace<PageTableMapper>,
        stack_top: VirtAddr,
        argv_bytes: &[u8; MAX_EXEC_ARGS * MAX_EXEC_ARG_LEN],
        argv_lens: &[usize; MAX_EXEC_ARGS],
        argc: usize,
        envp_bytes: &[u8; MAX_EXEC_ARGS * MAX_EXEC_ARG_LEN],
        envp_lens: &[usize; MAX_EXEC_ARGS],
        envc: usize,
    ) -> VirtAddr {
        let mut sp = stack_top.as_u64();

        // Auxiliary vector: just the AT_NULL terminator.
        sp -= 16;
        write_user_u64(space, VirtAddr::new_truncate(sp), 0);
        write_user_u64(space, VirtAddr::new_truncate(sp + 8), 0);

        let mut envp_addrs = [0u64; MAX_EXEC_ARGS];
        for i in (0..envc).rev() {
            let len = envp_lens[i] + 1;
            sp -= len as u64;
            let src = &envp_bytes[i * MAX_EXEC_ARG_LEN..i * MAX_EXEC_ARG_LEN + len];
            write_user_bytes(space, VirtAddr::new_truncate(sp), src);
            envp_addrs[i] = sp;
        }

        let mut argv_addrs = [0u64; MAX_EXEC_ARGS];
        for i in (0..argc).rev() {
            let len = argv_lens[i] + 1;
            sp -= len as u64;
            let src = &argv_bytes[i * MAX_EXEC_ARG_LEN..i * MAX_EXEC_ARG_LEN + len];
            write_user_bytes(space, VirtAddr::new_truncate(sp), src);
            argv_addrs[i] = sp;
        }

        sp &= !0xF;

        sp -= 8;
        write_user_u64(space, VirtAddr::new_truncate(sp), 0); // envp NULL terminator
        for i in (0..envc).rev() {
            sp -= 8;
            write_user_u64(space, VirtAddr::new_truncate(sp), envp_addrs[i]);
        }

        sp -= 8;
        write_user_u64(space, VirtAddr::new_truncate(sp), 0); // argv NULL terminator
        for i in (0..argc).rev() {
            sp -= 8;
            write_user_u64(space, VirtAddr::new_truncate(sp), argv_addrs[i]);
        }

        sp -= 8;
        write_user_u64(space, VirtAddr::new_truncate(sp), argc as u64);

        VirtAddr::new_truncate(sp)
    }

    /// Blocks until one of the caller's children exits, reaps it, and
    /// writes its exit code through `status_ptr` if non-null. Returns the
    /// reaped child's PID, or a negative [`Errno`] if the caller has no
    /// children.
    pub fn wait_current(status_ptr: usize) -> isize {
        let Some(tid) = SCHEDULER.current() else {
            return Errno::InvalidArgument.to_retval();
        };
        let Some(pid) = super::pid_for_tid(tid) else {
            return Errno::InvalidArgument.to_retval();
        };

        loop {
            let found = {
                let mut table = PROCESS_TABLE.lock();
                if !table.get(pid).map(|p| p.has_children()).unwrap_or(false) {
                    return Errno::NoSuchEntry.to_retval();
                }
                table.find_zombie_child(pid)
            };

            if let Some(child_pid) = found {
                let (exit_code, child_tid) = {
                    let mut table = PROCESS_TABLE.lock();
                    let child = table.remove(child_pid).expect("zombie child vanished");
                    table.get_mut(pid).map(|p| p.remove_child(child_pid));
                    (child.exit_code, child.main_thread)
                };
                crate::pid::free(child_pid);
                SCHEDULER.reap(child_tid);
                crate::tid::free(child_tid);
                {
                    let mut spaces = ADDRESS_SPACES.lock();
                    if let Some(mut child_space) = spaces[child_pid.as_u32() as usize].take() {
                        free_address_space(&mut child_space);
                    }
                }
                KERNEL_STACKS.lock()[child_tid.as_u32() as usize] = None;
                THREAD_OWNER.lock()[child_tid.as_u32() as usize] = None;

                if status_ptr != 0 {
                    let spaces = ADDRESS_SPACES.lock();
                    if let Some(space) = spaces[pid.as_u32() as usize].as_ref() {
                        if space.validate_user_range(VirtAddr::new_truncate(status_ptr as u64), 4, VmaFlags::WRITE) {
                            // SAFETY: validated above to be a writable
                            // 4-byte range in the caller's own address
                            // space.
                            unsafe {
                                core::ptr::write(status_ptr as *mut i32, exit_code);
                            }
                        }
                    }
                }
                return child_pid.as_u32() as isize;
            }

            SCHEDULER.thread_sleep(pid.as_u32() as u64);
        }
    }

    /// The calling thread's own PID.
    pub fn current_pid() -> isize {
        current_process_pid().map(|p| p.as_u32() as isize).unwrap_or_else(|| Errno::InvalidArgument.to_retval())
    }

    /// The calling thread's parent PID, or itself if it has none (init).
    pub fn current_ppid() -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        let table = PROCESS_TABLE.lock();
        match table.get(pid).and_then(|p| p.ppid) {
            Some(ppid) => ppid.as_u32() as isize,
            None => pid.as_u32() as isize,
        }
    }

    /// Voluntarily gives up the remainder of the current time slice.
    pub fn yield_current() {
        SCHEDULER.yield_now();
    }

    /// Reads up to `count` bytes from the console into the caller's
    /// buffer. Non-blocking: returns immediately with however many bytes
    /// (possibly zero) were waiting.
    pub fn read_stdin(buf_ptr: usize, count: usize) -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        let spaces = ADDRESS_SPACES.lock();
        let Some(space) = spaces[pid.as_u32() as usize].as_ref() else {
            return Errno::InvalidArgument.to_retval();
        };
        if !space.validate_user_range(VirtAddr::new_truncate(buf_ptr as u64), count, VmaFlags::WRITE) {
            return Errno::BadAddress.to_retval();
        }
        let mut n = 0usize;
        while n < count {
            match crate::arch::x86_64::serial::try_read_echo() {
                Some(byte) => {
                    // SAFETY: validated above.
                    unsafe { core::ptr::write((buf_ptr + n) as *mut u8, byte) };
                    n += 1;
                }
                None => break,
            }
        }
        n as isize
    }

    /// Writes `count` bytes from the caller's buffer to the console.
    pub fn write_console(buf_ptr: usize, count: usize) -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        let spaces = ADDRESS_SPACES.lock();
        let Some(space) = spaces[pid.as_u32() as usize].as_ref() else {
            return Errno::InvalidArgument.to_retval();
        };
        if !space.validate_user_range(VirtAddr::new_truncate(buf_ptr as u64), count, VmaFlags::READ) {
            return Errno::BadAddress.to_retval();
        }
        // SAFETY: validated above to be a readable range of at least
        // `count` bytes in the caller's own address space.
        let bytes = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, count) };
        crate::arch::x86_64::serial::write_bytes(bytes) as isize
    }

    /// Resolves capability slot `slot` in the calling process's capability
    /// space to an endpoint id, requiring it to carry every right in
    /// `required`. Every IPC syscall goes through this instead of indexing
    /// `ENDPOINTS` by a caller-supplied raw id directly.
    fn resolve_endpoint_capability(pid: Pid, slot: u32, required: ferrite_ipc::Rights) -> Result<EndpointId, isize> {
        let processes = PROCESS_TABLE.lock();
        let Some(process) = processes.get(pid) else {
            return Err(Errno::InvalidArgument.to_retval());
        };
        let cap = process
            .capability_space
            .lookup(slot)
            .map_err(|_| Errno::PermissionDenied.to_retval())?;
        if !cap.rights().contains(required) {
            return Err(Errno::PermissionDenied.to_retval());
        }
        match cap.kind() {
            ferrite_ipc::CapKind::Endpoint(id) => Ok(id),
            ferrite_ipc::CapKind::Notification(_) => Err(Errno::InvalidArgument.to_retval()),
        }
    }

    /// Looks up the endpoint capability at `slot`, checks `required`
    /// against its rights, and runs `f` against the resolved endpoint with
    /// `ENDPOINTS` locked.
    fn with_capability_endpoint(
        slot: usize,
        required: ferrite_ipc::Rights,
        f: impl FnOnce(&ferrite_ipc::Endpoint) -> isize,
    ) -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        let id = match resolve_endpoint_capability(pid, slot as u32, required) {
            Ok(id) => id,
            Err(retval) => return retval,
        };
        let idx = id.as_u32() as usize;
        if idx >= MAX_ENDPOINTS {
            return Errno::InvalidArgument.to_retval();
        }
        let endpoints = ENDPOINTS.lock();
        match endpoints[idx].as_ref() {
            Some(endpoint) => f(endpoint),
            None => Errno::NoSuchEntry.to_retval(),
        }
    }

    /// Sends a single fast-path message (tag plus up to four register
    /// words) through the endpoint named by capability slot `ep`.
    pub fn ipc_send(ep: usize, tag: usize, r1: usize, r2: usize, r3: usize, r4: usize) -> isize {
        with_capability_endpoint(ep, ferrite_ipc::Rights::SEND, |endpoint| {
            let msg = ferrite_ipc::Message::fast(
                ferrite_ipc::message::MessageTag::from_bits(tag as u64),
                [r1 as u64, r2 as u64, r3 as u64, r4 as u64, 0, 0, 0, 0],
            );
            match endpoint.send(&SCHEDULER, &msg) {
                Ok(()) => 0,
                Err(e) => -(e.to_tag_bits() as isize),
            }
        })
    }

    /// Receives a fast-path message from the endpoint named by capability
    /// slot `ep`, writing its tag and first four register words through
    /// `out_ptr` (5 consecutive `u64`s: tag bits, then `regs[0..4]`).
    pub fn ipc_recv(ep: usize, out_ptr: usize) -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        {
            let spaces = ADDRESS_SPACES.lock();
            let Some(space) = spaces[pid.as_u32() as usize].as_ref() else {
                return Errno::InvalidArgument.to_retval();
            };
            if !space.validate_user_range(VirtAddr::new_truncate(out_ptr as u64), 40, VmaFlags::WRITE) {
                return Errno::BadAddress.to_retval();
            }
        }
        with_capability_endpoint(ep, ferrite_ipc::Rights::RECV, |endpoint| match endpoint.recv(&SCHEDULER, false) {
            Ok(msg) => {
                let words = [msg.tag.to_bits(), msg.regs[0], msg.regs[1], msg.regs[2], msg.regs[3]];
                // SAFETY: validated above to be a writable 40-byte range
                // in the caller's own address space.
                unsafe { core::ptr::copy_nonoverlapping(words.as_ptr(), out_ptr as *mut u64, 5) };
                0
            }
            Err(e) => -(e.to_tag_bits() as isize),
        })
    }

    /// Creates a fresh endpoint owned by the calling process, inserts a
    /// full-rights capability for it into the caller's capability space,
    /// and returns that capability's slot index.
    pub fn endpoint_create(_flags: usize) -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        let id = NEXT_ENDPOINT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        if id as usize >= MAX_ENDPOINTS {
            return Errno::OutOfMemory.to_retval();
        }
        let endpoint = ferrite_ipc::Endpoint::new(EndpointId::new(id), pid, ferrite_ipc::EndpointFlags::BOUND);
        ENDPOINTS.lock()[id as usize] = Some(endpoint);

        let processes = PROCESS_TABLE.lock();
        let Some(process) = processes.get(pid) else {
            return Errno::InvalidArgument.to_retval();
        };
        let owner_rights =
            ferrite_ipc::Rights::SEND | ferrite_ipc::Rights::RECV | ferrite_ipc::Rights::GRANT | ferrite_ipc::Rights::REVOKE;
        match process.capability_space.insert(ferrite_ipc::CapKind::Endpoint(EndpointId::new(id)), owner_rights, 0) {
            Ok(slot) => slot as isize,
            Err(e) => -(e.to_tag_bits() as isize),
        }
    }

    /// Destroys the endpoint named by capability slot `ep`, waking every
    /// blocked sender/receiver with an error, and removes the capability
    /// itself.
    pub fn endpoint_destroy(ep: usize) -> isize {
        let Some(pid) = current_process_pid() else {
            return Errno::InvalidArgument.to_retval();
        };
        let id = match resolve_endpoint_capability(pid, ep as u32, ferrite_ipc::Rights::REVOKE) {
            Ok(id) => id,
            Err(retval) => return retval,
        };
        let idx = id.as_u32() as usize;
        if idx >= MAX_ENDPOINTS {
            return Errno::InvalidArgument.to_retval();
        }
        {
            let endpoints = ENDPOINTS.lock();
            match endpoints[idx].as_ref() {
                Some(endpoint) => endpoint.destroy(&SCHEDULER),
                None => return Errno::NoSuchEntry.to_retval(),
            }
        }
        if let Some(process) = PROCESS_TABLE.lock().get(pid) {
            let _ = process.capability_space.delete(ep as u32);
        }
        0
    }

    /// Writes `len` bytes from the caller straight to the console,
    /// bypassing file descriptor checks. A debug escape hatch, not a
    /// stable ABI surface.
    pub fn debug_print(buf_ptr: usize, len: usize) -> isize {
        write_console(buf_ptr, len)
    }

    /// Delegates a page fault to the faulting thread's own address space.
    /// Returns `false` if the fault is unresolvable (bad address, write to
    /// read-only mapping, kernel-address fault from user mode), in which
    /// case the IDT handler kills the machine with a formatted panic.
    pub fn handle_page_fault(cr2: VirtAddr, code: PageFaultErrorCode) -> bool {
        let Some(pid) = current_process_pid() else {
            return false;
        };
        let mut spaces = ADDRESS_SPACES.lock();
        let Some(space) = spaces[pid.as_u32() as usize].as_mut() else {
            return false;
        };
        let resolution = with_alloc(|alloc| space.handle_page_fault(cr2, code, alloc));
        matches!(resolution, ferrite_mm::address_space::FaultResolution::Resolved)
    }

    /// Advances the scheduler's tick count and timeslice accounting. Called
    /// from the timer IRQ handler at 100 Hz.
    pub fn timer_tick() {
        SCHEDULER.sched_tick();
    }

    /// Handles a keyboard IRQ by draining one byte from the UART. The
    /// actual byte delivery to a blocked reader happens through
    /// `read_stdin`'s polling; this just keeps the port's receive buffer
    /// from backing up between polls.
    pub fn keyboard_irq() {
        let _ = crate::arch::x86_64::serial::try_read_echo();
    }
}
