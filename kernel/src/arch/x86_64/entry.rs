//! First-entry-into-userspace trampoline.
//!
//! A freshly created thread's [`CpuContext`] is hand-built, not captured by
//! [`switch_context`](ferrite_core::arch::x86_64::switch_context): its
//! `rip` points here, and its `rsp` points at a small frame this trampoline
//! expects to find sitting on its own, exclusively-owned kernel stack.
//! `switch_context` reaches this function via `jmp`, not `call`, so it
//! never returns.

use ferrite_core::addr::VirtAddr;
use ferrite_core::arch::x86_64::CpuContext;

use super::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// RFLAGS for a freshly entered user thread: IF set, reserved bit 1 set,
/// everything else clear.
const USER_RFLAGS: u64 = 0x202;

/// Builds the initial [`CpuContext`] for a thread that should begin
/// execution in user mode at `entry` with stack pointer `user_rsp`,
/// seeing `rax_on_entry` in RAX (0 for a `fork` child resuming as if
/// its `fork()` call returned; otherwise unused).
///
/// Writes the iretq frame onto the thread's own kernel stack just below
/// `kernel_stack_top`, then points `context.rsp` at it.
///
/// # Safety
///
/// `kernel_stack_top` must be the top of a freshly allocated, exclusively
/// owned, mapped kernel stack at least 48 bytes deep.
pub unsafe fn build_user_entry_context(
    kernel_stack_top: VirtAddr,
    entry: VirtAddr,
    user_rsp: VirtAddr,
    rax_on_entry: u64,
) -> CpuContext {
    // SAFETY: caller guarantees kernel_stack_top is writable and owned.
    unsafe {
        let mut sp = kernel_stack_top.as_u64();
        let mut push = |value: u64| {
            sp -= 8;
            core::ptr::write(sp as *mut u64, value);
        };
        push(USER_DATA_SELECTOR.as_u16() as u64); // SS
        push(user_rsp.as_u64()); // RSP
        push(USER_RFLAGS); // RFLAGS
        push(USER_CODE_SELECTOR.as_u16() as u64); // CS
        push(entry.as_u64()); // RIP
        push(rax_on_entry); // popped into RAX before iretq

        CpuContext {
            rsp: sp,
            rip: user_entry_trampoline as usize as u64,
            ..Default::default()
        }
    }
}

#[unsafe(naked)]
unsafe extern "C" fn user_entry_trampoline() {
    core::arch::naked_asm!("pop rax", "iretq",);
}
