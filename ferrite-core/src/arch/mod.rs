//! Architecture-specific support.
//!
//! Only x86_64 is implemented; the spec's scope is a single architecture
//! and does not require the multi-arch abstraction layer a broader kernel
//! would carry.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
