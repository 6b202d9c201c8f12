//! Per-CPU state foundation (SMP-ready).
//!
//! Provides the fixed-layout per-CPU data block read by the SYSCALL entry
//! trampoline via GS-base-relative addressing, plus [`CpuLocal`] for
//! higher-level per-CPU storage indexed off of it. Only one instance (the
//! bootstrap processor) is populated today; `MAX_CPUS` and the surrounding
//! accessors are written so that bringing up additional processors only
//! means allocating more slots, not changing the addressing scheme.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

/// Syscall stack size for early boot (16 KiB), used as the fallback
/// bootstrap stack until a thread's own kernel stack is installed.
const EARLY_SYSCALL_STACK_SIZE: usize = 16384;

/// Aligned stack for early-boot syscall use.
#[repr(align(16))]
struct AlignedStack(
    #[allow(dead_code, reason = "backing storage accessed by assembly")]
    [u8; EARLY_SYSCALL_STACK_SIZE],
);

/// Dedicated fallback stack for the syscall entry path (early boot, and any
/// CPU that has not yet scheduled a thread).
///
/// Must be `static mut` so the linker places it in `.bss` (writable),
/// not `.rodata`. The assembly entry stub writes to this stack.
static mut BOOT_STACK: AlignedStack = AlignedStack([0; EARLY_SYSCALL_STACK_SIZE]);

/// Per-CPU data block.
///
/// `#[repr(C)]` gives deterministic field offsets for inline/naked assembly
/// access via `gs:`-relative addressing. The first four fields are in the
/// exact order the syscall entry trampoline expects and must never be
/// reordered:
///
/// - offset 0:  `user_rsp` — the user stack pointer saved on SYSCALL entry
/// - offset 8:  `kernel_rsp` — top of the current thread's kernel stack;
///   the scheduler rewrites this on every context switch
/// - offset 16: `scratch` — spare slot for the entry stub (pointer to the
///   saved-registers area for the in-flight syscall)
/// - offset 24: `boot_stack_top` — fallback stack used before any thread
///   has been scheduled on this CPU
///
/// Fields after the fixed prefix are ordinary Rust-accessed state.
#[repr(C)]
pub struct PerCpu {
    /// Saved user RSP during syscall handling (offset 0).
    pub user_rsp: u64,
    /// Kernel stack top for the next syscall / trap on this CPU (offset 8).
    pub kernel_rsp: u64,
    /// Scratch slot, currently used to stash the saved-registers pointer
    /// for the in-flight syscall (offset 16).
    pub scratch: u64,
    /// Fallback bootstrap stack top (offset 24).
    pub boot_stack_top: u64,
    /// Logical CPU ID (0 for the bootstrap processor).
    pub cpu_id: AtomicU32,
    /// Local APIC ID.
    pub apic_id: AtomicU8,
    /// Whether this per-CPU instance has been initialized.
    initialized: AtomicBool,
}

impl PerCpu {
    /// Creates a new uninitialized `PerCpu`.
    const fn new() -> Self {
        Self {
            user_rsp: 0,
            kernel_rsp: 0,
            scratch: 0,
            boot_stack_top: 0,
            cpu_id: AtomicU32::new(0),
            apic_id: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initializes this per-CPU instance.
    pub fn init(&self, cpu_id: u32, apic_id: u8) {
        self.cpu_id.store(cpu_id, Ordering::Relaxed);
        self.apic_id.store(apic_id, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Returns the CPU ID.
    pub fn get_cpu_id(&self) -> u32 {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// Returns the APIC ID.
    pub fn get_apic_id(&self) -> u8 {
        self.apic_id.load(Ordering::Relaxed)
    }

    /// Returns whether this instance has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// BSP per-CPU data (single static instance; `MAX_CPUS` governs the rest).
static mut BSP_PERCPU: PerCpu = PerCpu::new();

/// Returns a reference to the current CPU's per-CPU data.
///
/// Currently always returns the BSP instance; SMP bring-up indexes this by
/// APIC ID instead.
pub fn current_cpu() -> &'static PerCpu {
    // SAFETY: BSP_PERCPU is only mutated during early init (single-threaded),
    // and all subsequent accesses are read-only or via atomic fields.
    unsafe { &*core::ptr::addr_of!(BSP_PERCPU) }
}

/// Initializes GS-base MSRs to point to the BSP per-CPU data.
///
/// Sets both `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` to `&BSP_PERCPU` so
/// `swapgs` is a safe no-op when invoked from ring 0 before any user thread
/// has ever run. Also seeds `kernel_rsp`/`boot_stack_top` with the top of
/// the static bootstrap stack.
///
/// # Safety
///
/// Must be called after GDT init and before any syscall can be triggered.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_gs_base() {
    use crate::arch::x86_64::registers::model_specific::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};

    let percpu_addr = core::ptr::addr_of!(BSP_PERCPU) as u64;
    let stack_top = core::ptr::addr_of!(BOOT_STACK) as u64 + EARLY_SYSCALL_STACK_SIZE as u64;

    // SAFETY: BSP_PERCPU is a module-level static; addr_of_mut! is valid.
    // Writing both GS_BASE and KERNEL_GS_BASE to the same address means
    // swapgs is a no-op from ring 0, correct before any user process exists.
    unsafe {
        let percpu_ptr = core::ptr::addr_of_mut!(BSP_PERCPU);
        (*percpu_ptr).kernel_rsp = stack_top;
        (*percpu_ptr).boot_stack_top = stack_top;

        IA32_GS_BASE.write(percpu_addr);
        IA32_KERNEL_GS_BASE.write(percpu_addr);
    }

    crate::kdebug!(
        "GS base initialized: percpu={:#x}, kernel_rsp={:#x}",
        percpu_addr,
        stack_top
    );
}

/// Maximum supported CPUs. Single-CPU for now; the design accommodates
/// more by growing this constant and the backing arrays it sizes.
pub const MAX_CPUS: usize = 1;

/// CPU-local storage. Wraps `[T; MAX_CPUS]`, indexed by the current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    pub fn get(&self) -> &T {
        &self.data[current_cpu().get_cpu_id() as usize]
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU only accesses its own slot.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

/// Returns the early-boot kernel RSP (top of the static bootstrap stack).
/// Used during TSS initialization before a thread has its own kernel stack.
pub fn early_kernel_rsp() -> u64 {
    core::ptr::addr_of!(BOOT_STACK) as u64 + EARLY_SYSCALL_STACK_SIZE as u64
}

/// Updates the kernel stack pointer in the current per-CPU data.
///
/// Called by the scheduler on every context switch so that the next
/// SYSCALL or trap on this CPU lands on the newly-current thread's kernel
/// stack.
///
/// # Safety
///
/// Must only be called when it is safe to change the syscall return stack
/// (i.e. not while a trap frame for the previous thread is still live).
pub unsafe fn set_kernel_rsp(rsp: u64) {
    // SAFETY: BSP_PERCPU is a module-level static; addr_of_mut! is valid.
    unsafe {
        let percpu_ptr = core::ptr::addr_of_mut!(BSP_PERCPU);
        (*percpu_ptr).kernel_rsp = rsp;
    }
}

/// Points the scratch slot at `ptr`, read by the SYSCALL entry stub to
/// stash the in-flight syscall's caller state.
///
/// # Safety
///
/// `ptr` must stay valid for as long as syscalls can fire on this CPU
/// (in practice, for the lifetime of the kernel).
pub unsafe fn set_scratch(ptr: u64) {
    // SAFETY: BSP_PERCPU is a module-level static; addr_of_mut! is valid.
    unsafe {
        let percpu_ptr = core::ptr::addr_of_mut!(BSP_PERCPU);
        (*percpu_ptr).scratch = ptr;
    }
}
