//! The kernel: boot glue, process/thread management, and the syscall
//! dispatch table built on top of `ferrite-core`, `ferrite-mm`,
//! `ferrite-sched`, and `ferrite-ipc`.
//!
//! Mirrors the rest of the workspace's host-testable split: `pid` and
//! `process` operate on plain data and are exercised under `cargo test`
//! on the host, while `boot`, `main`, and everything under `arch` touch
//! real hardware and only run under `target_os = "none"`.

#![cfg_attr(target_os = "none", no_std)]

pub mod elf;
pub mod pid;
pub mod process;
pub mod syscall;
pub mod tid;

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod boot;
