//! Fixed-size slab caches backing general kernel allocation.
//!
//! Nine power-of-two size classes from 8 to 2048 bytes form the `kmalloc`
//! pool. Each cache tracks three explicit slab lists (full, partial, free)
//! rather than a single flat free-block list: a slab is a whole 4 KiB page
//! carved into equal-size objects linked through their first word when
//! free, and its list membership changes as objects are handed out or
//! returned. Allocations above the largest size class go straight to the
//! buddy allocator, rounded up to the smallest sufficient page count, and
//! are tracked as compound (non-slab) frames so `kfree` can route correctly.

use core::alloc::Layout;
use core::ptr::NonNull;

use ferrite_core::addr::PhysAddr;
use ferrite_core::paging::{PhysFrame, Size4KiB};
use ferrite_core::sync::SpinLock;

use crate::buddy::{self, AllocFlags};
use crate::{PAGE_SIZE, hhdm};

/// Size classes, smallest to largest.
const SIZE_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// Largest object a slab cache will serve; above this, allocation goes to
/// the buddy allocator directly.
const MAX_SLAB_SIZE: usize = 2048;

/// Errors from `kmalloc`/`kfree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// No frames available to grow a cache or satisfy a large allocation.
    OutOfMemory,
}

/// Slab header, embedded at the start of the page it describes.
///
/// The remaining bytes of the page are an array of `object_size`-sized
/// objects; each free object's first word is the intrusive free-list link.
#[repr(C)]
struct SlabHeader {
    /// Physical address of the page this header lives on (for list removal).
    phys: PhysAddr,
    free_head: *mut FreeObject,
    free_count: u32,
    capacity: u32,
    next: *mut SlabHeader,
    prev: *mut SlabHeader,
}

#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

/// Which of a cache's three lists a slab currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabList {
    Free,
    Partial,
    Full,
}

/// Intrusive doubly linked list of slab headers, used for the cache's
/// full/partial/free lists.
struct SlabListHead {
    head: *mut SlabHeader,
}

impl SlabListHead {
    const fn empty() -> Self {
        Self {
            head: core::ptr::null_mut(),
        }
    }

    fn push_front(&mut self, slab: *mut SlabHeader) {
        unsafe {
            (*slab).prev = core::ptr::null_mut();
            (*slab).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
        }
        self.head = slab;
    }

    fn remove(&mut self, slab: *mut SlabHeader) {
        unsafe {
            let prev = (*slab).prev;
            let next = (*slab).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

/// A single size-class cache: three slab lists (full, partial, free) and
/// the object size they're carved into.
struct SlabCache {
    object_size: usize,
    full: SlabListHead,
    partial: SlabListHead,
    free: SlabListHead,
    active_objects: usize,
}

impl SlabCache {
    const fn new(object_size: usize) -> Self {
        Self {
            object_size,
            full: SlabListHead::empty(),
            partial: SlabListHead::empty(),
            free: SlabListHead::empty(),
            active_objects: 0,
        }
    }

    fn objects_per_slab(&self) -> usize {
        (PAGE_SIZE - core::mem::size_of::<SlabHeader>()) / self.object_size
    }

    /// Carves a freshly-allocated, zeroed page into a new slab and pushes it
    /// onto the free list.
    fn grow(&mut self) -> Result<(), SlabError> {
        let phys = buddy::with(|pmm| pmm.alloc_pages(0, AllocFlags::default()))
            .ok_or(SlabError::OutOfMemory)?
            .start_address();
        buddy::with(|pmm| pmm.set_slab_owned(phys, true));

        let page_virt = hhdm::phys_to_virt(phys).as_u64() as *mut u8;
        let header = page_virt as *mut SlabHeader;
        let objects_per_slab = self.objects_per_slab();
        let data_start = unsafe { page_virt.add(core::mem::size_of::<SlabHeader>()) };

        let mut free_head: *mut FreeObject = core::ptr::null_mut();
        for i in (0..objects_per_slab).rev() {
            let obj = unsafe { data_start.add(i * self.object_size) as *mut FreeObject };
            unsafe { (*obj).next = free_head };
            free_head = obj;
        }

        unsafe {
            (*header).phys = phys;
            (*header).free_head = free_head;
            (*header).free_count = objects_per_slab as u32;
            (*header).capacity = objects_per_slab as u32;
            (*header).next = core::ptr::null_mut();
            (*header).prev = core::ptr::null_mut();
        }

        self.free.push_front(header);
        Ok(())
    }

    /// Allocates one object, growing the cache if every slab is full.
    fn alloc(&mut self) -> Result<NonNull<u8>, SlabError> {
        if self.partial.is_empty() {
            if self.free.is_empty() {
                self.grow()?;
            }
            // Move a slab from free to partial to serve the allocation.
            let slab = self.free.head;
            self.free.remove(slab);
            self.partial.push_front(slab);
        }

        let slab = self.partial.head;
        debug_assert!(!slab.is_null());
        let obj = unsafe { (*slab).free_head };
        unsafe {
            (*slab).free_head = (*obj).next;
            (*slab).free_count -= 1;
        }
        self.active_objects += 1;

        if unsafe { (*slab).free_count } == 0 {
            self.partial.remove(slab);
            self.full.push_front(slab);
        }

        // SAFETY: `obj` points into a slab page we just carved; it is
        // non-null and correctly aligned for `object_size`.
        Ok(unsafe { NonNull::new_unchecked(obj as *mut u8) })
    }

    /// Returns an object to the slab it belongs to, given the slab's header
    /// pointer (recovered from the page containing `ptr`).
    fn dealloc(&mut self, ptr: NonNull<u8>, slab: *mut SlabHeader) {
        let obj = ptr.as_ptr() as *mut FreeObject;
        let was_full = unsafe { (*slab).free_count == 0 };
        unsafe {
            (*obj).next = (*slab).free_head;
            (*slab).free_head = obj;
            (*slab).free_count += 1;
        }
        self.active_objects -= 1;

        if was_full {
            self.full.remove(slab);
            if unsafe { (*slab).free_count } == unsafe { (*slab).capacity } {
                self.partial.remove(slab);
                self.free.push_front(slab);
            } else {
                self.partial.push_front(slab);
            }
        } else if unsafe { (*slab).free_count } == unsafe { (*slab).capacity } {
            self.partial.remove(slab);
            self.free.push_front(slab);
        }
    }
}

// SAFETY: All SlabCache mutation happens under the owning SpinLock.
unsafe impl Send for SlabCache {}

/// Size-classed `kmalloc` pool.
pub struct SlabAllocator {
    caches: [SpinLock<SlabCache>; SIZE_CLASSES.len()],
}

impl SlabAllocator {
    pub const fn new() -> Self {
        Self {
            caches: [
                SpinLock::new(SlabCache::new(SIZE_CLASSES[0])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[1])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[2])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[3])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[4])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[5])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[6])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[7])),
                SpinLock::new(SlabCache::new(SIZE_CLASSES[8])),
            ],
        }
    }

    fn class_index(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&s| s >= size)
    }

    /// Allocates memory matching `layout`. Returns `None` for a zero-sized
    /// layout, matching `kmalloc(0)`'s documented absent result.
    pub fn kmalloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        let size = layout.size().max(layout.align());
        if size > MAX_SLAB_SIZE {
            return self.alloc_large(size);
        }
        let idx = Self::class_index(size)?;
        self.caches[idx].lock().alloc().ok()
    }

    /// Allocates and zero-fills memory matching `layout`.
    pub fn kzalloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = self.kmalloc(layout)?;
        // SAFETY: `ptr` was just allocated with room for at least `layout.size()`.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
        Some(ptr)
    }

    /// Frees memory previously returned by [`kmalloc`]/[`kzalloc`] with the
    /// same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator with exactly `layout`.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>, layout: Layout) {
        let size = layout.size().max(layout.align());
        if size > MAX_SLAB_SIZE {
            unsafe { self.free_large(ptr, size) };
            return;
        }
        let Some(idx) = Self::class_index(size) else {
            return;
        };
        let page_addr = (ptr.as_ptr() as usize) & !(PAGE_SIZE - 1);
        let slab = page_addr as *mut SlabHeader;
        self.caches[idx].lock().dealloc(ptr, slab);
    }

    fn alloc_large(&self, size: usize) -> Option<NonNull<u8>> {
        let pages = size.div_ceil(PAGE_SIZE);
        let order = pages.next_power_of_two().trailing_zeros() as usize;
        let frame = buddy::with(|pmm| pmm.alloc_pages(order, AllocFlags::default()))?;
        let virt = hhdm::phys_to_virt(frame.start_address()).as_u64() as *mut u8;
        NonNull::new(virt)
    }

    unsafe fn free_large(&self, ptr: NonNull<u8>, size: usize) {
        let phys = hhdm::virt_to_phys(ferrite_core::addr::VirtAddr::new_truncate(
            ptr.as_ptr() as u64,
        ));
        let frame: PhysFrame<Size4KiB> = PhysFrame::containing_address(phys);
        let order = buddy::with(|pmm| pmm.frame_order(phys));
        debug_assert_eq!(order, size.div_ceil(PAGE_SIZE).next_power_of_two().trailing_zeros() as usize);
        buddy::with(|pmm| pmm.free_pages(frame, order));
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global kmalloc pool.
static KMALLOC: SlabAllocator = SlabAllocator::new();

/// Allocates memory matching `layout` from the global pool.
pub fn kmalloc(layout: Layout) -> Option<NonNull<u8>> {
    KMALLOC.kmalloc(layout)
}

/// Allocates and zero-fills memory matching `layout` from the global pool.
pub fn kzalloc(layout: Layout) -> Option<NonNull<u8>> {
    KMALLOC.kzalloc(layout)
}

/// Frees memory previously returned by [`kmalloc`]/[`kzalloc`].
///
/// # Safety
///
/// `ptr` must have been allocated by the global pool with exactly `layout`.
pub unsafe fn kfree(ptr: NonNull<u8>, layout: Layout) {
    unsafe { KMALLOC.kfree(ptr, layout) };
}

#[cfg(test)]
mod tests {
    use std::sync::Once;

    use super::*;
    use crate::PhysMemoryRegion;

    static INIT: Once = Once::new();

    /// Brings up the global HHDM offset and PMM exactly once for the whole
    /// test binary, backed by a leaked host buffer standing in for physical
    /// memory 0..size (mirrors the boot-time singleton init these globals
    /// expect, which only tolerates a single call).
    fn ensure_global_pmm() {
        INIT.call_once(|| {
            let size = 4 * 1024 * 1024;
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            hhdm::init(ptr as u64);
            let regions = [PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: size as u64,
                usable: true,
            }];
            buddy::init(&regions, ptr as u64);
        });
    }

    #[test]
    fn class_index_rounds_up() {
        assert_eq!(SlabAllocator::class_index(1), Some(0));
        assert_eq!(SlabAllocator::class_index(8), Some(0));
        assert_eq!(SlabAllocator::class_index(9), Some(1));
        assert_eq!(SlabAllocator::class_index(2048), Some(8));
        assert_eq!(SlabAllocator::class_index(2049), None);
    }

    #[test]
    fn kmalloc_zero_size_is_absent() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        let local = SlabAllocator::new();
        assert!(local.kmalloc(layout).is_none());
    }

    #[test]
    fn kmalloc_round_trip_reuses_freed_slot() {
        ensure_global_pmm();
        let local = SlabAllocator::new();
        let layout = Layout::from_size_align(64, 8).unwrap();

        let a = local.kmalloc(layout).unwrap();
        let b = local.kmalloc(layout).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        unsafe { local.kfree(a, layout) };
        let c = local.kmalloc(layout).unwrap();
        // The freed slot is the most recently vacated one in its slab.
        assert_eq!(a.as_ptr(), c.as_ptr());

        unsafe {
            local.kfree(b, layout);
            local.kfree(c, layout);
        }
    }

    #[test]
    fn kzalloc_zero_fills() {
        ensure_global_pmm();
        let local = SlabAllocator::new();
        let layout = Layout::from_size_align(128, 8).unwrap();
        let ptr = local.kzalloc(layout).unwrap();
        let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 128) };
        assert!(slice.iter().all(|&b| b == 0));
        unsafe { local.kfree(ptr, layout) };
    }

    #[test]
    fn large_allocation_routes_to_buddy() {
        ensure_global_pmm();
        let local = SlabAllocator::new();
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        let ptr = local.kmalloc(layout).unwrap();
        unsafe { local.kfree(ptr, layout) };
    }
}
