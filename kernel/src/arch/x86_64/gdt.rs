//! GDT + TSS bring-up.
//!
//! Segment order is fixed by the SYSCALL/SYSRET MSR programming in
//! `ferrite_core::arch::x86_64::syscall::init`: kernel code at 0x08,
//! kernel data at 0x10, user data at 0x18, user code at 0x20, so that
//! `STAR` (kernel base 0x08, SYSRET base 0x10) produces exactly those
//! selectors.

use ferrite_core::arch::x86_64::instructions::segmentation;
use ferrite_core::arch::x86_64::structures::gdt::{
    Descriptor, GlobalDescriptorTable, SegmentSelector, TaskStateSegment,
};

/// Size of the per-CPU double-fault stack, used via IST1.
const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

#[repr(align(16))]
struct DoubleFaultStack([u8; DOUBLE_FAULT_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: DoubleFaultStack = DoubleFaultStack([0; DOUBLE_FAULT_STACK_SIZE]);

static mut TSS: TaskStateSegment = TaskStateSegment::new();
static mut GDT: GlobalDescriptorTable<8> = GlobalDescriptorTable::new();

pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, 0);
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(2, 0);
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(3, 3);
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(4, 3);

/// Builds the GDT and TSS, loads them, and reloads every segment register.
///
/// `kernel_stack_top` seeds `privilege_stack_table[0]` (RSP0), used when a
/// ring-3 thread traps into the kernel before the scheduler has assigned
/// it a real kernel stack.
///
/// # Safety
///
/// Must run exactly once per CPU, before IDT load and before enabling
/// interrupts.
pub unsafe fn init(kernel_stack_top: u64) {
    unsafe {
        let df_stack_top =
            core::ptr::addr_of!(DOUBLE_FAULT_STACK) as u64 + DOUBLE_FAULT_STACK_SIZE as u64;

        let tss_ptr = core::ptr::addr_of_mut!(TSS);
        (*tss_ptr).privilege_stack_table[0] = kernel_stack_top;
        (*tss_ptr).interrupt_stack_table[0] = df_stack_top;

        let gdt_ptr = core::ptr::addr_of_mut!(GDT);
        let kernel_code = (*gdt_ptr).append(Descriptor::kernel_code_segment());
        let kernel_data = (*gdt_ptr).append(Descriptor::kernel_data_segment());
        let user_data = (*gdt_ptr).append(Descriptor::user_data_segment());
        let user_code = (*gdt_ptr).append(Descriptor::user_code_segment());
        let tss_ref: &'static TaskStateSegment = &*core::ptr::addr_of!(TSS);
        let tss_selector = (*gdt_ptr).append(Descriptor::tss_segment(tss_ref));

        debug_assert_eq!(kernel_code, KERNEL_CODE_SELECTOR);
        debug_assert_eq!(kernel_data, KERNEL_DATA_SELECTOR);
        debug_assert_eq!(user_data, USER_DATA_SELECTOR);
        debug_assert_eq!(user_code, USER_CODE_SELECTOR);

        (&*core::ptr::addr_of!(GDT)).load();
        segmentation::set_cs(KERNEL_CODE_SELECTOR.as_u16());
        segmentation::load_ds(KERNEL_DATA_SELECTOR.as_u16());
        segmentation::load_ss(KERNEL_DATA_SELECTOR.as_u16());
        segmentation::load_es(KERNEL_DATA_SELECTOR.as_u16());
        segmentation::load_tss(tss_selector.as_u16());
    }
}

/// Updates RSP0 (the stack used when trapping from ring 3 into ring 0)
/// to `kernel_stack_top`. Called by the scheduler on every context switch
/// to a user thread.
pub fn set_kernel_stack(kernel_stack_top: u64) {
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = kernel_stack_top;
    }
}
