//! Per-zone buddy physical frame allocator.
//!
//! Frames are tracked by a flat [`PageFrame`] metadata array (one record per
//! 4 KiB frame reported by the bootloader) and grouped into [`Zone`]s by
//! physical address range. Each zone owns a buddy free-area array indexed by
//! order (0..=MAX_ORDER); allocation splits the smallest sufficient block,
//! free coalesces with the buddy at each order until no further merge is
//! possible.
//!
//! A bump allocator carves the bootstrap frame array out of the largest
//! usable region before the buddy lists exist; once [`init`] returns, all
//! further allocation goes through the zones. There is no separate
//! occupancy bitmap: each [`PageFrame`]'s own `IN_BUDDY` flag bit already
//! records exactly the same fact (on a free area or not) that a bitmap
//! would, at the same one-bit-per-frame cost, without a second structure
//! to keep in sync on every alloc/free.

use ferrite_core::addr::PhysAddr;
use ferrite_core::paging::{PhysFrame, Size4KiB};
use ferrite_core::sync::SpinLock;

use crate::{FrameAllocator, FrameDeallocator, PhysMemoryRegion, PmmError};

/// Highest buddy order tracked (order 10 = 1024 frames = 4 MiB).
pub const MAX_ORDER: usize = 10;

const FRAME_SIZE: u64 = 4096;

/// Zone boundaries, in bytes from address 0.
const DMA_LIMIT: u64 = 16 * 1024 * 1024;
const DMA32_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Which physical-address-range zone a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// 0 – 16 MiB. Reserved for legacy DMA-capable devices.
    Dma,
    /// 16 MiB – 4 GiB. Reachable by 32-bit DMA engines.
    Dma32,
    /// 4 GiB and above.
    Normal,
}

impl ZoneKind {
    fn classify(phys: u64) -> Self {
        if phys < DMA_LIMIT {
            ZoneKind::Dma
        } else if phys < DMA32_LIMIT {
            ZoneKind::Dma32
        } else {
            ZoneKind::Normal
        }
    }

    const ALL: [ZoneKind; 3] = [ZoneKind::Dma, ZoneKind::Dma32, ZoneKind::Normal];
}

bitflags::bitflags! {
    /// Per-frame state flags, stored in [`PageFrame::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Frame is not part of any allocatable zone (MMIO hole, firmware-reserved, ...).
        const RESERVED       = 1 << 0;
        /// Frame currently sits on a buddy free area.
        const IN_BUDDY       = 1 << 1;
        /// Frame backs a slab cache object.
        const SLAB_OWNED     = 1 << 2;
        /// Frame is the first frame of a multi-frame (order > 0) allocation.
        const COMPOUND_HEAD  = 1 << 3;
        /// Frame is a non-first frame of a multi-frame allocation.
        const COMPOUND_TAIL  = 1 << 4;
    }
}

/// Allocation request modifiers for [`alloc_pages`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    /// Zero the returned frames via their HHDM alias before returning.
    pub zero: bool,
    /// Prefer the DMA zone, falling back to DMA32 then Normal on exhaustion.
    pub dma: bool,
    /// Prefer the DMA32 zone, falling back to Normal on exhaustion.
    pub dma32: bool,
}

/// One record per physical 4 KiB frame.
///
/// Cache-line sized so a frame's metadata never straddles two lines under
/// concurrent access from different CPUs.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct PageFrame {
    flags: FrameFlags,
    /// Buddy order this frame is tracked at. Meaningful only while on a free area.
    order: u8,
    zone: u8,
    /// Free-area link (index of next free frame in the same order's list, or
    /// `u32::MAX` for end-of-list). Meaningful only while `IN_BUDDY` is set.
    free_next: u32,
    /// Reference count for allocated, non-free frames.
    refcount: u32,
    _pad: [u8; 64 - 4 - 1 - 1 - 4 - 4],
}

impl PageFrame {
    const fn empty() -> Self {
        Self {
            flags: FrameFlags::RESERVED,
            order: 0,
            zone: 0,
            free_next: u32::MAX,
            refcount: 0,
            _pad: [0; 64 - 4 - 1 - 1 - 4 - 4],
        }
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn order(&self) -> usize {
        self.order as usize
    }
}

const _: () = assert!(core::mem::size_of::<PageFrame>() == 64);

/// A contiguous buddy free area: a singly linked list of free blocks at a
/// fixed order, threaded through [`PageFrame::free_next`].
struct FreeArea {
    head: u32,
    count: usize,
}

impl FreeArea {
    const fn empty() -> Self {
        Self {
            head: u32::MAX,
            count: 0,
        }
    }
}

struct Zone {
    kind: ZoneKind,
    free_areas: [FreeArea; MAX_ORDER + 1],
    free_frames: usize,
}

impl Zone {
    const fn new(kind: ZoneKind) -> Self {
        const EMPTY: FreeArea = FreeArea::empty();
        Self {
            kind,
            free_areas: [EMPTY; MAX_ORDER + 1],
            free_frames: 0,
        }
    }
}

/// Per-zone buddy allocator plus the flat frame metadata array backing it.
pub struct BuddyAllocator {
    frames: &'static mut [PageFrame],
    zones: [Zone; 3],
    hhdm_offset: u64,
}

impl BuddyAllocator {
    /// Builds the allocator from the bootloader's memory map.
    ///
    /// Bootstraps the frame metadata array from the largest usable region
    /// via a bump allocator, then walks every usable run of frames and
    /// hands it to the buddy lists of the owning zone, splitting at the
    /// largest naturally aligned block that fits.
    ///
    /// # Safety
    ///
    /// - `hhdm_offset` must be the correct HHDM offset, already initialized.
    /// - `regions` must accurately describe physical memory and must not
    ///   overlap.
    /// - Must be called exactly once during boot.
    pub unsafe fn new(regions: &[PhysMemoryRegion], hhdm_offset: u64) -> Result<Self, PmmError> {
        let max_phys = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.start.as_u64() + r.size)
            .max()
            .unwrap_or(0);
        if max_phys == 0 {
            return Err(PmmError::OutOfMemory);
        }
        let total_frames = (max_phys / FRAME_SIZE) as usize;

        // Bump-allocate the frame metadata array out of the largest usable region.
        let array_bytes = total_frames * core::mem::size_of::<PageFrame>();
        let largest = regions
            .iter()
            .filter(|r| r.usable)
            .max_by_key(|r| r.size)
            .ok_or(PmmError::NoBitmapRegion)?;
        if largest.size < array_bytes as u64 {
            return Err(PmmError::NoBitmapRegion);
        }
        let array_frame_count = (array_bytes as u64).div_ceil(FRAME_SIZE);

        // SAFETY: `largest` is a usable region of at least `array_bytes`,
        // reachable through the HHDM at `hhdm_offset`. We are the sole
        // consumer of this memory during boot.
        let frames: &'static mut [PageFrame] = unsafe {
            let ptr = (hhdm_offset + largest.start.as_u64()) as *mut PageFrame;
            core::ptr::write_bytes(ptr, 0, total_frames * core::mem::size_of::<PageFrame>());
            let slice = core::slice::from_raw_parts_mut(ptr, total_frames);
            for frame in slice.iter_mut() {
                *frame = PageFrame::empty();
            }
            slice
        };

        let zones = [
            Zone::new(ZoneKind::Dma),
            Zone::new(ZoneKind::Dma32),
            Zone::new(ZoneKind::Normal),
        ];

        // Mark the whole array reserved by default; unreserve usable runs below.
        for frame in frames.iter_mut() {
            frame.flags = FrameFlags::RESERVED;
        }

        let bump_start_frame = (largest.start.as_u64() / FRAME_SIZE) as usize;
        let bump_end_frame = bump_start_frame + array_frame_count as usize;

        let mut allocator = Self {
            frames,
            zones,
            hhdm_offset,
        };

        for region in regions.iter().filter(|r| r.usable) {
            let region_start_frame = (region.start.as_u64() / FRAME_SIZE) as usize;
            let region_frame_count = (region.size / FRAME_SIZE) as usize;
            let mut i = 0;
            while i < region_frame_count {
                let frame_idx = region_start_frame + i;
                if frame_idx >= total_frames {
                    break;
                }
                // Skip frames carved out for the bump-allocated metadata array.
                if frame_idx >= bump_start_frame && frame_idx < bump_end_frame {
                    i += 1;
                    continue;
                }

                let order = allocator.largest_aligned_order(frame_idx, region_start_frame + region_frame_count);
                allocator.free_run(frame_idx, order);
                i += 1usize << order;
            }
        }

        Ok(allocator)
    }

    /// Largest order such that a `1 << order`-frame, naturally aligned block
    /// starting at `frame_idx` stays within `[frame_idx, region_end)`.
    fn largest_aligned_order(&self, frame_idx: usize, region_end: usize) -> usize {
        let mut order = MAX_ORDER;
        while order > 0 {
            let block = 1usize << order;
            let aligned = frame_idx % block == 0;
            let fits = frame_idx + block <= region_end && frame_idx + block <= self.frames.len();
            if aligned && fits {
                break;
            }
            order -= 1;
        }
        order
    }

    fn zone_for(&mut self, kind: ZoneKind) -> &mut Zone {
        &mut self.zones[ZoneKind::ALL.iter().position(|k| *k == kind).unwrap()]
    }

    /// Marks `1 << order` frames starting at `frame_idx` free and pushes the
    /// block onto its zone's free area at `order`.
    fn free_run(&mut self, frame_idx: usize, order: usize) {
        let phys = frame_idx as u64 * FRAME_SIZE;
        let kind = ZoneKind::classify(phys);
        self.frames[frame_idx].flags = FrameFlags::IN_BUDDY;
        self.frames[frame_idx].order = order as u8;
        self.frames[frame_idx].zone = ZoneKind::ALL.iter().position(|k| *k == kind).unwrap() as u8;

        let zone = self.zone_for(kind);
        let area = &mut zone.free_areas[order];
        self.frames[frame_idx].free_next = area.head;
        area.head = frame_idx as u32;
        area.count += 1;
        zone.free_frames += 1usize << order;
    }

    /// Removes the head block of `area` at `order` in `zone_idx`, returning its frame index.
    fn pop_free(&mut self, zone_idx: usize, order: usize) -> Option<usize> {
        let area = &mut self.zones[zone_idx].free_areas[order];
        if area.head == u32::MAX {
            return None;
        }
        let idx = area.head as usize;
        area.head = self.frames[idx].free_next;
        area.count -= 1;
        self.zones[zone_idx].free_frames -= 1usize << order;
        self.frames[idx].flags.remove(FrameFlags::IN_BUDDY);
        Some(idx)
    }

    fn push_free(&mut self, zone_idx: usize, order: usize, idx: usize) {
        let area = &mut self.zones[zone_idx].free_areas[order];
        self.frames[idx].flags.insert(FrameFlags::IN_BUDDY);
        self.frames[idx].order = order as u8;
        self.frames[idx].free_next = area.head;
        area.head = idx as u32;
        area.count += 1;
        self.zones[zone_idx].free_frames += 1usize << order;
    }

    fn zone_index(kind: ZoneKind) -> usize {
        ZoneKind::ALL.iter().position(|k| *k == kind).unwrap()
    }

    /// Candidate zone search order for a given allocation preference,
    /// falling back toward `Normal` on exhaustion.
    fn zone_order(flags: AllocFlags) -> &'static [ZoneKind] {
        if flags.dma {
            &[ZoneKind::Dma, ZoneKind::Dma32, ZoneKind::Normal]
        } else if flags.dma32 {
            &[ZoneKind::Dma32, ZoneKind::Normal]
        } else {
            &[ZoneKind::Normal, ZoneKind::Dma32, ZoneKind::Dma]
        }
    }

    /// Allocates `1 << order` contiguous, naturally aligned frames.
    ///
    /// Scans free areas from `order` upward in the first zone with a
    /// nonempty area at or above that order, splitting the found block
    /// down to the requested order and pushing upper-half buddies onto
    /// progressively lower free areas.
    pub fn alloc_pages(&mut self, order: usize, flags: AllocFlags) -> Option<PhysFrame<Size4KiB>> {
        if order > MAX_ORDER {
            return None;
        }
        for &kind in Self::zone_order(flags) {
            let zone_idx = Self::zone_index(kind);
            let mut found_order = None;
            for o in order..=MAX_ORDER {
                if self.zones[zone_idx].free_areas[o].head != u32::MAX {
                    found_order = Some(o);
                    break;
                }
            }
            let Some(mut cur_order) = found_order else {
                continue;
            };
            let head = self.pop_free(zone_idx, cur_order).expect("area was nonempty");

            // Repeatedly split the block, returning the upper half to the
            // next-lower free area, until we reach the requested order.
            while cur_order > order {
                cur_order -= 1;
                let buddy = head ^ (1usize << cur_order);
                self.push_free(zone_idx, cur_order, buddy);
            }

            self.frames[head].flags = FrameFlags::empty();
            self.frames[head].order = order as u8;
            if flags.zero {
                let phys = PhysAddr::new(head as u64 * FRAME_SIZE);
                // SAFETY: `phys` is within HHDM range; the frame was just
                // removed from the free list and is not aliased elsewhere.
                unsafe {
                    let virt = (self.hhdm_offset + phys.as_u64()) as *mut u8;
                    core::ptr::write_bytes(virt, 0, FRAME_SIZE as usize * (1usize << order));
                }
            }
            if order > 0 {
                self.frames[head].flags.insert(FrameFlags::COMPOUND_HEAD);
                for tail in head + 1..head + (1usize << order) {
                    self.frames[tail].flags = FrameFlags::COMPOUND_TAIL;
                }
            }

            let phys = PhysAddr::new(head as u64 * FRAME_SIZE);
            return Some(PhysFrame::containing_address(phys));
        }
        None
    }

    /// Frees a block of `1 << order` frames previously returned by
    /// [`alloc_pages`] with the same order.
    ///
    /// Coalesces with the buddy at each order, starting at `order`, while
    /// the buddy is free, in-bounds, and the same order.
    pub fn free_pages(&mut self, frame: PhysFrame<Size4KiB>, order: usize) {
        let mut idx = (frame.start_address().as_u64() / FRAME_SIZE) as usize;
        self.frames[idx].flags.remove(FrameFlags::COMPOUND_HEAD);
        for tail in idx + 1..idx + (1usize << order) {
            self.frames[tail].flags.remove(FrameFlags::COMPOUND_TAIL);
        }

        let zone_idx = self.frames[idx].zone as usize;
        let mut cur_order = order;
        while cur_order < MAX_ORDER {
            let buddy = idx ^ (1usize << cur_order);
            if buddy >= self.frames.len() {
                break;
            }
            let buddy_frame = &self.frames[buddy];
            if !buddy_frame.flags.contains(FrameFlags::IN_BUDDY) || buddy_frame.order() != cur_order
            {
                break;
            }
            // Remove the buddy from its free area by relinking past it.
            self.unlink_free(zone_idx, cur_order, buddy);
            idx = idx.min(buddy);
            cur_order += 1;
        }
        self.push_free(zone_idx, cur_order, idx);
    }

    /// Removes a specific frame from a free area's linked list, wherever it
    /// sits (not necessarily the head).
    fn unlink_free(&mut self, zone_idx: usize, order: usize, target: usize) {
        let area = &mut self.zones[zone_idx].free_areas[order];
        if area.head as usize == target {
            area.head = self.frames[target].free_next;
        } else {
            let mut cur = area.head;
            while cur != u32::MAX {
                let next = self.frames[cur as usize].free_next;
                if next as usize == target {
                    self.frames[cur as usize].free_next = self.frames[target].free_next;
                    break;
                }
                cur = next;
            }
        }
        area.count -= 1;
        self.zones[zone_idx].free_frames -= 1usize << order;
        self.frames[target].flags.remove(FrameFlags::IN_BUDDY);
    }

    /// Total free frames across all zones.
    pub fn free_frames(&self) -> usize {
        self.zones.iter().map(|z| z.free_frames).sum()
    }

    /// Total frames tracked (including reserved).
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Marks the frame backing `phys` as slab-owned or not, so [`free`] can
    /// tell slab objects from whole-page/compound allocations.
    pub fn set_slab_owned(&mut self, phys: PhysAddr, owned: bool) {
        let idx = (phys.as_u64() / FRAME_SIZE) as usize;
        if owned {
            self.frames[idx].flags.insert(FrameFlags::SLAB_OWNED);
        } else {
            self.frames[idx].flags.remove(FrameFlags::SLAB_OWNED);
        }
    }

    /// Returns the flags recorded for the frame backing `phys`.
    pub fn frame_flags(&self, phys: PhysAddr) -> FrameFlags {
        let idx = (phys.as_u64() / FRAME_SIZE) as usize;
        self.frames[idx].flags
    }

    /// Returns the buddy order recorded for the frame backing `phys`.
    ///
    /// Valid for compound-head or order-0 allocations; meaningless for
    /// compound-tail frames.
    pub fn frame_order(&self, phys: PhysAddr) -> usize {
        let idx = (phys.as_u64() / FRAME_SIZE) as usize;
        self.frames[idx].order()
    }

    /// Sum, across all zones and orders, of `nr_free << order`. Used in
    /// tests to cross-check against [`Self::free_frames`]'s running
    /// counter.
    pub fn free_frames_by_areas(&self) -> usize {
        self.zones
            .iter()
            .flat_map(|z| z.free_areas.iter().enumerate())
            .map(|(order, area)| area.count << order)
            .sum()
    }
}

/// Wrapper implementing [`FrameAllocator`]/[`FrameDeallocator`] at order 0
/// by forwarding to `&mut BuddyAllocator`.
pub struct BuddyFrameAllocRef<'a>(pub &'a mut BuddyAllocator);

unsafe impl FrameAllocator<Size4KiB> for BuddyFrameAllocRef<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.0.alloc_pages(0, AllocFlags::default())
    }
}

unsafe impl FrameDeallocator<Size4KiB> for BuddyFrameAllocRef<'_> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.0.free_pages(frame, 0);
    }
}

// ---------------------------------------------------------------------------
// Global PMM
// ---------------------------------------------------------------------------

static PMM: SpinLock<Option<BuddyAllocator>> = SpinLock::new(None);

/// Initializes the global PMM from the bootloader's memory map.
///
/// # Panics
///
/// Panics if called more than once, or if no usable region is large enough
/// to host the bootstrap frame array.
pub fn init(regions: &[PhysMemoryRegion], hhdm_offset: u64) {
    // SAFETY: called exactly once, during boot, before any other PMM access.
    let allocator =
        unsafe { BuddyAllocator::new(regions, hhdm_offset).expect("failed to initialize PMM") };
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Executes a closure with exclusive access to the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Attempts to execute a closure with exclusive access to the global PMM.
///
/// Returns `None` if the lock is already held (e.g. re-entrant access from a
/// fault handler) or the PMM is not yet initialized, rather than blocking.
pub fn try_with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> Option<R> {
    let mut pmm = PMM.try_lock()?;
    Some(f(pmm.as_mut()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    /// Backing store standing in for "physical memory 0..size": real host
    /// memory, with physical address 0 mapped to its base. Matches the host
    /// test pattern of treating a host allocation's address as the HHDM
    /// offset rather than writing to raw low physical addresses.
    struct FakePhysMemory {
        ptr: *mut u8,
        layout: Layout,
    }

    impl FakePhysMemory {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn hhdm_offset(&self) -> u64 {
            self.ptr as u64
        }
    }

    impl Drop for FakePhysMemory {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn with_allocator<R>(
        size: usize,
        regions: &[PhysMemoryRegion],
        f: impl FnOnce(&mut BuddyAllocator, u64) -> R,
    ) -> R {
        let mem = FakePhysMemory::new(size);
        let mut allocator = unsafe { BuddyAllocator::new(regions, mem.hhdm_offset()).unwrap() };
        f(&mut allocator, mem.hhdm_offset())
    }

    fn regions() -> Vec<PhysMemoryRegion> {
        vec![
            PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: 0x100000,
                usable: false,
            },
            PhysMemoryRegion {
                start: PhysAddr::new(0x100000),
                size: 0x7F00000,
                usable: true,
            },
        ]
    }

    #[test]
    fn init_reports_expected_totals() {
        let regions = regions();
        with_allocator(0x8000000, &regions, |allocator, _hhdm| {
            assert_eq!(allocator.total_frames(), 0x8000000 / 4096);
            assert!(allocator.free_frames() > 0);
            assert_eq!(allocator.free_frames(), allocator.free_frames_by_areas());
        });
    }

    #[test]
    fn alloc_then_free_restores_free_count() {
        let regions = regions();
        with_allocator(0x8000000, &regions, |allocator, _hhdm| {
            let before = allocator.free_frames();
            let frame = allocator.alloc_pages(2, AllocFlags::default()).unwrap();
            assert_eq!(allocator.free_frames(), before - 4);
            allocator.free_pages(frame, 2);
            assert_eq!(allocator.free_frames(), before);
            assert_eq!(allocator.free_frames(), allocator.free_frames_by_areas());
        });
    }

    #[test]
    fn alloc_zero_zeroes_memory() {
        let regions = regions();
        with_allocator(0x8000000, &regions, |allocator, hhdm| {
            let flags = AllocFlags {
                zero: true,
                ..Default::default()
            };
            let frame = allocator.alloc_pages(0, flags).unwrap();
            let ptr = (hhdm + frame.start_address().as_u64()) as *const u8;
            let slice = unsafe { core::slice::from_raw_parts(ptr, 4096) };
            assert!(slice.iter().all(|&b| b == 0));
        });
    }

    #[test]
    fn order_zero_alloc_is_not_compound() {
        let regions = regions();
        with_allocator(0x8000000, &regions, |allocator, _hhdm| {
            let frame = allocator.alloc_pages(0, AllocFlags::default()).unwrap();
            let idx = (frame.start_address().as_u64() / FRAME_SIZE) as usize;
            assert!(!allocator.frames[idx].flags().contains(FrameFlags::COMPOUND_HEAD));
        });
    }

    #[test]
    fn compound_allocation_marks_tail_frames() {
        let regions = regions();
        with_allocator(0x8000000, &regions, |allocator, _hhdm| {
            let frame = allocator.alloc_pages(2, AllocFlags::default()).unwrap();
            let idx = (frame.start_address().as_u64() / FRAME_SIZE) as usize;
            assert!(allocator.frames[idx].flags().contains(FrameFlags::COMPOUND_HEAD));
            assert!(allocator.frames[idx + 1].flags().contains(FrameFlags::COMPOUND_TAIL));
            assert!(allocator.frames[idx + 3].flags().contains(FrameFlags::COMPOUND_TAIL));
        });
    }

    #[test]
    fn exhaustion_returns_none_without_panicking() {
        let regions = vec![PhysMemoryRegion {
            start: PhysAddr::new(0),
            size: 0x10000,
            usable: true,
        }];
        with_allocator(0x10000, &regions, |allocator, _hhdm| {
            let mut allocated = Vec::new();
            while let Some(f) = allocator.alloc_pages(0, AllocFlags::default()) {
                allocated.push(f);
            }
            assert!(allocator.alloc_pages(0, AllocFlags::default()).is_none());
            assert_eq!(allocator.free_frames(), 0);
        });
    }

    #[test]
    fn zone_classification_boundaries() {
        assert_eq!(ZoneKind::classify(0), ZoneKind::Dma);
        assert_eq!(ZoneKind::classify(DMA_LIMIT), ZoneKind::Dma32);
        assert_eq!(ZoneKind::classify(DMA32_LIMIT), ZoneKind::Normal);
    }
}
