//! Higher-half direct map (HHDM) global offset and address conversion.
//!
//! The HHDM maps all physical memory at a fixed virtual offset handed to us
//! by the bootloader. Stored globally so the buddy allocator, slab caches,
//! and address space code can convert between physical and virtual addresses
//! without threading the offset through every call site.

use core::sync::atomic::{AtomicU64, Ordering};

use ferrite_core::addr::{PhysAddr, VirtAddr};

const HHDM_UNINIT: u64 = u64::MAX;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(HHDM_UNINIT);

/// Initializes the global HHDM offset. Must be called exactly once, early in boot.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(offset: u64) {
    let prev =
        HHDM_OFFSET.compare_exchange(HHDM_UNINIT, offset, Ordering::Release, Ordering::Relaxed);
    assert!(prev.is_ok(), "HHDM: already initialized");
}

/// Returns the HHDM offset.
///
/// # Panics
///
/// Panics if called before [`init`].
#[inline]
pub fn offset() -> u64 {
    let val = HHDM_OFFSET.load(Ordering::Acquire);
    assert!(val != HHDM_UNINIT, "HHDM: accessed before initialization");
    val
}

/// Converts a physical address to its HHDM virtual address.
#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys.as_u64() + offset())
}

/// Converts an HHDM virtual address back to a physical address.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64() - offset())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_round_trips_for_fixed_offset() {
        let off = 0x1000_0000u64;
        let phys = PhysAddr::new(0x2000);
        let virt = VirtAddr::new_truncate(phys.as_u64() + off);
        assert_eq!(virt.as_u64() - off, phys.as_u64());
    }
}
