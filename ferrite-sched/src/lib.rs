//! Preemptive priority scheduler: per-CPU run queue, thread records, the
//! `schedule()` suspension point, and channel-based sleep/wake.
//!
//! Host-testable: nothing here touches real page tables or a real CPU. The
//! only architecture-specific piece, the callee-saved register context
//! switch, is injected as a function pointer ([`sched::ContextSwitchFn`])
//! rather than linked in directly, so the policy above it can be exercised
//! with `cargo test` on the development host.

#![cfg_attr(target_os = "none", no_std)]

pub mod runqueue;
pub mod sched;
pub mod thread;
pub mod waitqueue;

pub use runqueue::RunQueue;
pub use sched::{SchedError, Scheduler};
pub use thread::{Thread, ThreadFlags, ThreadState, ThreadTable};
pub use waitqueue::WaitQueue;
