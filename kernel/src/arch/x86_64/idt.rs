//! IDT bring-up: the 32 CPU exceptions, the legacy IRQ vectors (32-47),
//! and the fatal-fault dump shared by most of them.

use ferrite_core::arch::x86_64::registers::control::Cr2;
use ferrite_core::arch::x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};
use ferrite_core::arch::x86_64::structures::paging::PageFaultErrorCode;
use ferrite_core::{kerr, kwarn};

use super::pic;

static mut IDT: InterruptDescriptorTable = InterruptDescriptorTable::new();

/// IRQ vector for the PIT timer tick.
pub const IRQ0_TIMER: u8 = pic::PIC1_OFFSET;
/// IRQ vector for the keyboard.
pub const IRQ1_KEYBOARD: u8 = pic::PIC1_OFFSET + 1;

/// Builds the IDT and loads it.
///
/// # Safety
///
/// Must run exactly once per CPU, after GDT init.
pub unsafe fn init() {
    unsafe {
        let idt = core::ptr::addr_of_mut!(IDT);
        (*idt).divide_error.set_handler(divide_error_handler);
        (*idt).debug.set_handler(debug_handler);
        (*idt).nmi.set_handler(nmi_handler);
        (*idt).breakpoint.set_handler(breakpoint_handler);
        (*idt).overflow.set_handler(overflow_handler);
        (*idt).bound_range.set_handler(fatal_handler);
        (*idt).invalid_opcode.set_handler(fatal_handler);
        (*idt).device_not_available.set_handler(fatal_handler);
        (*idt)
            .double_fault
            .set_diverging_handler_with_err_code(double_fault_handler);
        (*idt)
            .invalid_tss
            .set_handler_with_err_code(fatal_handler_ec);
        (*idt)
            .segment_not_present
            .set_handler_with_err_code(fatal_handler_ec);
        (*idt)
            .stack_segment_fault
            .set_handler_with_err_code(fatal_handler_ec);
        (*idt)
            .general_protection
            .set_handler_with_err_code(general_protection_handler);
        (*idt).page_fault.set_handler_with_err_code(page_fault_handler);
        (*idt).x87_floating_point.set_handler(fatal_handler);
        (*idt).alignment_check.set_handler_with_err_code(fatal_handler_ec);
        (*idt).machine_check.set_diverging_handler(machine_check_handler);
        (*idt).simd_floating_point.set_handler(fatal_handler);

        (*idt)[IRQ0_TIMER].set_handler(timer_handler);
        (*idt)[IRQ1_KEYBOARD].set_handler(keyboard_handler);

        (&*core::ptr::addr_of!(IDT)).load();
    }
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    kerr!("divide error at {:#x}", frame.instruction_pointer.as_u64());
    panic!("divide error");
}

extern "x86-interrupt" fn debug_handler(_frame: InterruptStackFrame) {
    // Single-step/debug-register trap; ring 3 may legitimately hit this
    // when a debugger is attached. Nothing to do but acknowledge and return.
}

extern "x86-interrupt" fn nmi_handler(frame: InterruptStackFrame) {
    kwarn!("NMI at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    kwarn!("breakpoint (int3) at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    kerr!("overflow at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn fatal_handler(frame: InterruptStackFrame) {
    kerr!("fatal exception at {:#x}: {:?}", frame.instruction_pointer.as_u64(), frame);
    panic!("unhandled fatal exception");
}

extern "x86-interrupt" fn fatal_handler_ec(frame: InterruptStackFrame, error_code: u64) {
    kerr!(
        "fatal exception at {:#x}, error code {:#x}: {:?}",
        frame.instruction_pointer.as_u64(),
        error_code,
        frame
    );
    panic!("unhandled fatal exception");
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    kerr!(
        "double fault at {:#x}, error code {:#x}: {:?}",
        frame.instruction_pointer.as_u64(),
        error_code,
        frame
    );
    loop {
        ferrite_core::arch::x86_64::instructions::interrupts::hlt();
    }
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    kerr!("machine check at {:#x}", frame.instruction_pointer.as_u64());
    loop {
        ferrite_core::arch::x86_64::instructions::interrupts::hlt();
    }
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, error_code: u64) {
    kerr!(
        "general protection fault at {:#x}, selector {:#x}",
        frame.instruction_pointer.as_u64(),
        error_code
    );
    panic!("general protection fault");
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    let cr2 = ferrite_core::addr::VirtAddr::new_truncate(Cr2::read());
    let code = PageFaultErrorCode::from_bits_truncate(error_code);
    if !crate::boot::runtime::handle_page_fault(cr2, code) {
        kerr!(
            "unresolved page fault at {:#x} (cr2={:#x}, code={:?})",
            frame.instruction_pointer.as_u64(),
            cr2.as_u64(),
            code
        );
        panic!("unresolved page fault");
    }
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    crate::boot::runtime::timer_tick();
    pic::send_eoi(0);
}

extern "x86-interrupt" fn keyboard_handler(_frame: InterruptStackFrame) {
    crate::boot::runtime::keyboard_irq();
    pic::send_eoi(1);
}
