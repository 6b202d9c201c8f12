//! Core types and synchronization primitives shared by the rest of the
//! kernel workspace: typed addresses, page/frame abstractions, per-CPU
//! state, resource identifiers, and the architecture glue (GDT/IDT,
//! registers, SYSCALL/SYSRET trampoline, user-mode entry).
//!
//! `ferrite-mm`, `ferrite-sched`, and `ferrite-ipc` all build on top of
//! these types rather than duplicating them, and `ferrite-core` itself
//! stays host-testable (no real page tables, no real CPU) except for
//! `arch::x86_64`, which is only ever compiled for the kernel target.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]

pub mod addr;
pub mod arch;
pub mod error;
pub mod id;
pub mod log;
pub mod paging;
pub mod percpu;
pub mod static_assert;
pub mod sync;
