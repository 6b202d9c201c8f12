//! x86_64 bring-up: GDT/TSS, IDT, PIC remap, and the PIT tick source.

pub mod entry;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod serial;

/// Brings up segmentation, interrupts, and the timer, in the order each
/// step depends on: GDT before TSS load, IDT before PIC unmask, PIC remap
/// before PIT programming and before `sti`.
///
/// # Safety
///
/// Must be called exactly once, early in boot, with interrupts disabled.
pub unsafe fn init(kernel_stack_top: u64) {
    unsafe {
        gdt::init(kernel_stack_top);
        idt::init();
        pic::remap_and_mask();
        pit::init();
        ferrite_core::arch::x86_64::instructions::interrupts::enable();
    }
}
