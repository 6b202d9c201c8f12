//! Architecture support, gated to the real kernel target.

pub mod x86_64;
