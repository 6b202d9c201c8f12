//! x86_64 architecture support.

pub mod context;
pub mod instructions;
pub mod pit;
pub mod registers;
pub mod structures;
pub mod syscall;
pub mod userspace;

// Re-export commonly used types for ergonomic imports.
pub use context::{CpuContext, switch_context};
pub use instructions::port::{Port, PortRead, PortWrite, ReadOnlyPort, WriteOnlyPort};
pub use structures::machine_state::MachineState;
pub use structures::paging::{PageTable, PageTableEntry, PageTableFlags};
