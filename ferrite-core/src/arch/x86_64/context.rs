//! Kernel-thread context switch.
//!
//! A thread's [`CpuContext`] holds exactly the state the calling convention
//! doesn't save for us: the callee-saved general-purpose registers and the
//! stack pointer. [`switch_context`] is the other half of the scheduler's
//! suspension point described alongside it in `ferrite-sched`: it never
//! "returns" to its caller in the usual sense — it returns into whatever
//! function `next` was last switched away from.

/// Saved callee-saved registers and stack pointer for one thread.
///
/// Populated by [`switch_context`] when a thread is switched away from, and
/// consumed by it when the thread is switched back to. A thread's initial
/// context is hand-built (see `ferrite-sched::thread`) so that the first
/// switch into it lands in its designated trampoline.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CpuContext {
    /// Stack pointer at the point of suspension.
    pub rsp: u64,
    /// Instruction pointer to resume at (the return address `switch_context`
    /// itself would use, for a thread that's been switched away from at
    /// least once; the trampoline entry point otherwise).
    pub rip: u64,
    /// RBX.
    pub rbx: u64,
    /// RBP.
    pub rbp: u64,
    /// R12.
    pub r12: u64,
    /// R13.
    pub r13: u64,
    /// R14.
    pub r14: u64,
    /// R15.
    pub r15: u64,
}

/// Switches from `prev`'s context to `next`'s.
///
/// Saves the current callee-saved registers and stack pointer into `*prev`,
/// then loads `*next`'s and jumps to its saved `rip`. Execution resumes in
/// the caller's stack frame the *next* time some other thread switches back
/// to `prev`.
///
/// # Safety
///
/// - `prev` and `next` must point to valid, distinct [`CpuContext`] values.
/// - `next` must have been produced either by a prior `switch_context` call
///   that saved it, or hand-built to resume at a valid trampoline with a
///   valid stack.
/// - Interrupts should be disabled across the call on the first switch into
///   a freshly created thread, since its trampoline assumes it is entered
///   with the incoming thread's initial register slots intact.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(prev: *mut CpuContext, next: *const CpuContext) {
    core::arch::naked_asm!(
        // Save prev's callee-saved registers (rdi = prev). rsp is saved
        // exactly as the calling convention left it: pointing at the
        // return address `call switch_context` just pushed.
        "mov [rdi + 16], rbx",
        "mov [rdi + 24], rbp",
        "mov [rdi + 32], r12",
        "mov [rdi + 40], r13",
        "mov [rdi + 48], r14",
        "mov [rdi + 56], r15",
        "mov [rdi + 0], rsp",
        // prev resumes at the label below the next time something switches
        // back to it.
        "lea rax, [rip + 2f]",
        "mov [rdi + 8], rax",
        // Restore next's callee-saved registers (rsi = next) and jump to
        // its saved rip.
        "mov rbx, [rsi + 16]",
        "mov rbp, [rsi + 24]",
        "mov r12, [rsi + 32]",
        "mov r13, [rsi + 40]",
        "mov r14, [rsi + 48]",
        "mov r15, [rsi + 56]",
        "mov rsp, [rsi + 0]",
        "jmp qword ptr [rsi + 8]",
        "2:",
        "ret",
    );
}
