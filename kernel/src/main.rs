//! Limine boot stub.
//!
//! Converts the bootloader's handoff into a [`kernel::boot::BootInfoData`]
//! and calls [`kernel::boot::kernel_init`]. Keeps the bootloader's own page
//! tables rather than building fresh ones: Limine already maps the HHDM and
//! the kernel image by the time `_start` runs, and this kernel's [`BootInfo`
//! contract](kernel::boot::BootInfo) only asks for that root to be kept
//! alive, not replaced.

#![no_std]
#![no_main]

mod requests;

use requests::REQUESTS;

use ferrite_core::addr::PhysAddr;
use ferrite_core::arch::x86_64::registers::control::{Cr3, Cr4, Cr4Flags};
use ferrite_core::arch::x86_64::registers::model_specific::{EferFlags, IA32_EFER};
use ferrite_core::{kfatal, kinfo, kwarn};
use ferrite_mm::PhysMemoryRegion;
use kernel::boot::{BootInfoData, MAX_MEMORY_REGIONS};
use planck_noalloc::vec::ArrayVec;

/// Limine entry point. Called by the bootloader once it has loaded the
/// kernel image and populated [`REQUESTS`] with its responses. Never
/// returns.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    // SAFETY: first thing to run, single CPU, nothing else touches COM1 yet.
    unsafe { kernel::arch::x86_64::serial::init() };

    assert!(REQUESTS.base_revision.is_supported(), "unsupported Limine base revision");
    kinfo!("ferrite booting via Limine...");

    let hhdm_offset = REQUESTS
        .hhdm
        .response()
        .expect("HHDM response not available")
        .hhdm_base;

    let memmap_response = REQUESTS.memmap.response().expect("memory map response not available");
    let memory_map = build_memory_map(memmap_response);
    let max_physical_address = memory_map
        .iter()
        .map(|region| region.start.as_u64() + region.size)
        .max()
        .unwrap_or(0);

    let rsdp_address = REQUESTS
        .rsdp
        .response()
        .map(|resp| PhysAddr::new(resp.rsdp_addr - hhdm_offset));
    let command_line = REQUESTS.cmdline.response().map(|resp| resp.cmdline());

    // The bootloader's page tables are still live in CR3 at this point;
    // this kernel keeps using them rather than building its own.
    let page_table_root = Cr3::read();

    // SAFETY: runs once, before interrupts are enabled, before any other
    // code depends on NXE/PGE semantics.
    unsafe { enable_cpu_features() };

    kinfo!(
        "memory map: {} regions, {} MiB addressable, HHDM offset {:#x}",
        memory_map.len(),
        max_physical_address / (1024 * 1024),
        hhdm_offset,
    );
    if let Some(cmdline) = command_line {
        kinfo!("command line: {cmdline}");
    }
    match kernel::elf::find_embedded("init") {
        Some(_) => {}
        None => kwarn!("no embedded \"init\" binary; kernel will idle forever"),
    }

    let boot_info = BootInfoData {
        memory_map,
        hhdm_offset,
        page_table_root,
        max_physical_address,
        rsdp_address,
        command_line,
    };

    // SAFETY: called exactly once, with the machine in the single-CPU,
    // interrupts-disabled state `kernel_init` expects.
    unsafe { kernel::boot::kernel_init(&boot_info) }
}

fn build_memory_map(
    response: &limine::MemMapResponse,
) -> ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS> {
    let mut regions = ArrayVec::new();
    for entry in response.entries() {
        regions.push(PhysMemoryRegion {
            start: PhysAddr::new(entry.base),
            size: entry.length,
            usable: entry.type_ == limine::memmap::MemMapEntryType::Usable,
        });
    }
    regions
}

/// Enables EFER.NXE (so [`PageTableFlags::NO_EXECUTE`](ferrite_core::arch::x86_64::structures::paging::PageTableFlags::NO_EXECUTE)
/// has effect) and CR4.PGE (so [`PageTableFlags::GLOBAL`](ferrite_core::arch::x86_64::structures::paging::PageTableFlags::GLOBAL)
/// pages skip TLB flushes).
///
/// # Safety
///
/// Must run before any code relies on either bit's behavior, and only once.
unsafe fn enable_cpu_features() {
    unsafe {
        let efer = IA32_EFER.read();
        IA32_EFER.write(efer | EferFlags::NO_EXECUTE_ENABLE.bits());

        Cr4::write(Cr4::read() | Cr4Flags::PGE);
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kfatal!("{info}");
    loop {
        ferrite_core::arch::x86_64::instructions::interrupts::disable();
        ferrite_core::arch::x86_64::instructions::interrupts::hlt();
    }
}
