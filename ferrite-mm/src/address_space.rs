//! User address space management.
//!
//! Each process owns an [`AddressSpace`] that holds a per-process PML4
//! with the kernel upper half copied from the kernel root page table.
//! User pages are mapped into the lower half (entries 0–255), tracked by
//! a sorted, non-overlapping list of [`VMArea`] records.

use ferrite_core::addr::{PhysAddr, VirtAddr};
use ferrite_core::arch::x86_64::structures::paging::PageFaultErrorCode;
use ferrite_core::paging::{Page, PhysFrame, Size4KiB};
use planck_noalloc::vec::ArrayVec;

use crate::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, UnmapError};
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE, VmmError};

/// Number of PML4 entries in the upper half (indices 256–511).
const KERNEL_PML4_ENTRIES: usize = 256;

/// Maximum number of VM areas tracked per address space.
const MAX_VMAS: usize = 128;

/// Lowest usable user-space address. Leaves the null page and the first
/// few pages unmapped so a null-pointer dereference always faults.
pub const USER_SPACE_BASE: u64 = 0x0000_0000_0040_0000;

/// One page below the end of the canonical lower half: the highest address
/// `mmap` and user VMAs may ever reach.
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_F000;

/// Stride `mmap` advances by when scanning for a free gap.
const MMAP_SCAN_STRIDE: u64 = 1024 * 1024;

/// How many pages below a `stack`-flagged VMA are still considered part of
/// its guard region and eligible for automatic growth.
const STACK_GROWTH_PAGES: u64 = 256;

/// Callback for deallocating a single physical frame.
///
/// Stored at construction time so that `Drop` can free the PML4 frame
/// without needing access to a `FrameDeallocator` parameter.
pub type FrameDeallocFn = fn(PhysFrame<Size4KiB>);

#[inline]
fn page_align_up(size: u64) -> u64 {
    (size + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

bitflags::bitflags! {
    /// Access and purpose flags for a [`VMArea`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u8 {
        /// Readable.
        const READ      = 1 << 0;
        /// Writable.
        const WRITE     = 1 << 1;
        /// Executable.
        const EXECUTE   = 1 << 2;
        /// Shared between address spaces rather than copy-on-write.
        const SHARED    = 1 << 3;
        /// Grows downward on demand when a fault lands in its guard region.
        const STACK     = 1 << 4;
        /// Part of the process heap (program break).
        const HEAP      = 1 << 5;
        /// Anonymous memory (not backed by a file).
        const ANONYMOUS = 1 << 6;
        /// File-backed.
        const FILE      = 1 << 7;
    }
}

impl VmaFlags {
    /// Derives page-table mapping flags from this VMA's access flags.
    /// The `USER` bit is added unconditionally by the caller.
    fn to_map_flags(self) -> MapFlags {
        let mut flags = MapFlags::empty();
        if self.contains(VmaFlags::WRITE) {
            flags |= MapFlags::WRITABLE;
        }
        if self.contains(VmaFlags::EXECUTE) {
            flags |= MapFlags::EXECUTABLE;
        }
        flags
    }
}

/// A `[start, end)` virtual address range with uniform access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMArea {
    /// Start address (inclusive, page-aligned).
    pub start: VirtAddr,
    /// End address (exclusive, page-aligned).
    pub end: VirtAddr,
    /// Access and purpose flags.
    pub flags: VmaFlags,
}

impl VMArea {
    #[inline]
    fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    #[inline]
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start.as_u64() < end && start < self.end.as_u64()
    }
}

/// Outcome of [`AddressSpace::handle_page_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The fault was resolved (demand page, COW copy, or stack growth).
    Resolved,
    /// The access is invalid; the thread should be delivered a fatal signal
    /// or killed.
    Fatal,
}

/// A user-mode address space backed by its own PML4.
///
/// The upper half (PML4 entries 256–511) is shared with the kernel;
/// the lower half (entries 0–255) is process-private and described by
/// `areas`, a sorted, non-overlapping list of [`VMArea`] records.
///
/// On drop, the PML4 frame is freed via the stored deallocation callback.
/// Backing frames for any remaining VMAs are *not* freed by `Drop` — callers
/// must `unmap_region` everything (or rely on process teardown to do so
/// with a real frame deallocator) before the address space goes away.
pub struct AddressSpace<M: PageMapper<Size4KiB> + PageTranslator> {
    /// Physical address of this address space's PML4 frame.
    root_phys: PhysAddr,
    /// Page table mapper (shared, knows HHDM offset).
    mapper: M,
    /// HHDM offset, used to zero newly allocated frames directly.
    hhdm_offset: u64,
    /// Callback to free physical frames on drop.
    dealloc_fn: FrameDeallocFn,
    /// VM areas, sorted by `start`, pairwise non-overlapping.
    areas: ArrayVec<VMArea, MAX_VMAS>,
}

impl<M: PageMapper<Size4KiB> + PageTranslator> AddressSpace<M> {
    /// Creates a new user address space.
    ///
    /// Allocates a fresh PML4 frame and copies the kernel upper half
    /// (entries 256–511) from `kernel_root`. The lower half is zeroed.
    ///
    /// `dealloc_fn` is stored and called in `Drop` to free the PML4 frame.
    ///
    /// # Safety
    ///
    /// `kernel_root` must point to a valid PML4 used by the kernel.
    /// `alloc` must return zeroed 4 KiB frames.
    pub unsafe fn new_user(
        kernel_root: PhysAddr,
        mapper: M,
        hhdm_offset: u64,
        alloc: &mut impl FrameAllocator<Size4KiB>,
        dealloc_fn: FrameDeallocFn,
    ) -> Result<Self, VmmError> {
        let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        let new_pml4_phys = frame.start_address();

        // SAFETY: The frames are accessible via HHDM. We zero the user half
        // and copy the kernel half.
        unsafe {
            let new_pml4 = (hhdm_offset + new_pml4_phys.as_u64()) as *mut u64;
            let kernel_pml4 = (hhdm_offset + kernel_root.as_u64()) as *const u64;

            // Zero the lower half (entries 0–255).
            core::ptr::write_bytes(new_pml4, 0, KERNEL_PML4_ENTRIES);

            // Copy the upper half (entries 256–511) from the kernel PML4.
            core::ptr::copy_nonoverlapping(
                kernel_pml4.add(KERNEL_PML4_ENTRIES),
                new_pml4.add(KERNEL_PML4_ENTRIES),
                KERNEL_PML4_ENTRIES,
            );
        }

        Ok(Self {
            root_phys: new_pml4_phys,
            mapper,
            hhdm_offset,
            dealloc_fn,
            areas: ArrayVec::new(),
        })
    }

    /// Maps a single 4 KiB page into the user address space.
    ///
    /// The `USER` flag is always added to `flags`.
    ///
    /// Returns a [`MapFlush`] that the caller must handle.
    pub fn map_user_page(
        &self,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<MapFlush, VmmError> {
        let flags = flags | MapFlags::USER;
        // SAFETY: The AddressSpace owns its PML4 (root_phys). The caller
        // provides a valid physical frame and allocator for page table pages.
        let flush = unsafe {
            self.mapper
                .map(self.root_phys, page, frame, flags, &mut || {
                    alloc
                        .allocate_frame()
                        .expect("PMM: out of memory during user map")
                })
        };
        Ok(flush)
    }

    /// Unmaps a single 4 KiB page from the user address space.
    ///
    /// Flushes the TLB internally and returns the freed frame.
    pub fn unmap_user_page(&self, page: Page<Size4KiB>) -> Result<PhysFrame<Size4KiB>, VmmError> {
        let (frame, flush) = unsafe {
            self.mapper
                .unmap(self.root_phys, page)
                .map_err(|e| match e {
                    UnmapError::NotMapped => VmmError::NotMapped,
                    UnmapError::SizeMismatch => VmmError::SizeMismatch,
                })?
        };
        flush.flush();
        Ok(frame)
    }

    /// Returns the physical address of this address space's PML4.
    ///
    /// Used for loading into CR3 on context switch.
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Translates a virtual address within this address space.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        unsafe { <M as PageTranslator>::translate_addr(&self.mapper, self.root_phys, virt) }
    }

    /// Returns the VM areas currently tracked, sorted by `start`.
    pub fn areas(&self) -> &[VMArea] {
        self.areas.as_slice()
    }

    /// Returns the VMA containing `addr`, if any.
    pub fn find_area(&self, addr: VirtAddr) -> Option<&VMArea> {
        let idx = self.area_index_at_or_before(addr)?;
        let area = &self.areas[idx];
        if area.contains(addr) { Some(area) } else { None }
    }

    /// Index of the last area whose `start <= addr`, or `None` if every area
    /// starts after `addr`.
    fn area_index_at_or_before(&self, addr: VirtAddr) -> Option<usize> {
        let slice = self.areas.as_slice();
        match slice.binary_search_by_key(&addr.as_u64(), |a| a.start.as_u64()) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Index at which a new area starting at `start` would be inserted to
    /// keep the list sorted.
    fn insertion_index(&self, start: u64) -> usize {
        let slice = self.areas.as_slice();
        match slice.binary_search_by_key(&start, |a| a.start.as_u64()) {
            Ok(i) | Err(i) => i,
        }
    }

    /// `true` if no tracked area overlaps `[start, start+size)`.
    fn range_is_free(&self, start: u64, size: u64) -> bool {
        let end = start + size;
        self.areas.iter().all(|a| !a.overlaps(start, end))
    }

    /// Reserves a VMA, eagerly allocates and zero-fills backing frames, and
    /// maps them with protections derived from `flags`.
    ///
    /// Rolls back any partial mapping if the allocator runs out of memory
    /// partway through.
    pub fn map_region(
        &mut self,
        start: VirtAddr,
        size: u64,
        flags: VmaFlags,
        alloc: &mut impl FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        let aligned_size = page_align_up(size);
        if aligned_size == 0 {
            return Ok(());
        }
        let start_addr = start.as_u64();
        let end_addr = start_addr + aligned_size;

        if !self.range_is_free(start_addr, aligned_size) {
            return Err(VmmError::Overlap);
        }

        if self.areas.is_full() {
            return Err(VmmError::AreaListFull);
        }

        let map_flags = flags.to_map_flags();
        // High-water mark of the last page successfully mapped, so a
        // failure partway through can be unwound without a second
        // fixed-capacity structure to track which pages were touched.
        let mut addr = start_addr;
        let result = loop {
            if addr >= end_addr {
                break Ok(());
            }
            let frame = match alloc.allocate_frame() {
                Some(f) => f,
                None => break Err(VmmError::OutOfMemory),
            };

            // SAFETY: frame was just allocated and is not aliased elsewhere;
            // it is reachable through the HHDM.
            unsafe {
                crate::zero_frame((self.hhdm_offset + frame.start_address().as_u64()) as *mut u8);
            }

            let page = Page::<Size4KiB>::containing_address(VirtAddr::new_truncate(addr));
            match self.map_user_page(page, frame, map_flags, alloc) {
                Ok(flush) => flush.flush(),
                Err(e) => {
                    // SAFETY: the frame was just allocated and never mapped.
                    unsafe { alloc.deallocate_frame(frame) };
                    break Err(e);
                }
            }

            addr += PAGE_SIZE as u64;
        };

        if let Err(e) = result {
            let mut undo = start_addr;
            while undo < addr {
                let page = Page::<Size4KiB>::containing_address(VirtAddr::new_truncate(undo));
                if let Ok(frame) = self.unmap_user_page(page) {
                    // SAFETY: frame was owned exclusively by this mapping.
                    unsafe { alloc.deallocate_frame(frame) };
                }
                undo += PAGE_SIZE as u64;
            }
            return Err(e);
        }

        let idx = self.insertion_index(start_addr);
        self.areas.insert(
            idx,
            VMArea {
                start,
                end: VirtAddr::new_truncate(end_addr),
                flags,
            },
        );

        Ok(())
    }

    /// Unmaps every page in `[start, start+size)`, frees the backing frames,
    /// and trims or splits the covering VMA(s) accordingly.
    pub fn unmap_region(
        &mut self,
        start: VirtAddr,
        size: u64,
        dealloc: &mut impl FrameDeallocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        let aligned_size = page_align_up(size);
        if aligned_size == 0 {
            return Ok(());
        }
        let start_addr = start.as_u64();
        let end_addr = start_addr + aligned_size;

        let mut new_areas: ArrayVec<VMArea, MAX_VMAS> = ArrayVec::new();
        let mut touched = false;

        for i in 0..self.areas.len() {
            let area = self.areas[i];
            if !area.overlaps(start_addr, end_addr) {
                new_areas
                    .try_push(area)
                    .map_err(|_| VmmError::AreaListFull)?;
                continue;
            }
            touched = true;

            let overlap_start = core::cmp::max(area.start.as_u64(), start_addr);
            let overlap_end = core::cmp::min(area.end.as_u64(), end_addr);

            let mut addr = overlap_start;
            while addr < overlap_end {
                let page = Page::<Size4KiB>::containing_address(VirtAddr::new_truncate(addr));
                if let Ok(frame) = self.unmap_user_page(page) {
                    // SAFETY: the frame was exclusively backing this VMA.
                    unsafe { dealloc.deallocate_frame(frame) };
                }
                addr += PAGE_SIZE as u64;
            }

            if area.start.as_u64() < overlap_start {
                new_areas
                    .try_push(VMArea {
                        start: area.start,
                        end: VirtAddr::new_truncate(overlap_start),
                        flags: area.flags,
                    })
                    .map_err(|_| VmmError::AreaListFull)?;
            }
            if overlap_end < area.end.as_u64() {
                new_areas
                    .try_push(VMArea {
                        start: VirtAddr::new_truncate(overlap_end),
                        end: area.end,
                        flags: area.flags,
                    })
                    .map_err(|_| VmmError::AreaListFull)?;
            }
        }

        if !touched {
            return Err(VmmError::NoSuchArea);
        }

        self.areas = new_areas;
        Ok(())
    }

    /// Rewrites the PTEs covering `[start, start+size)` in place and updates
    /// the flags of the covering VMA(s), splitting where the range only
    /// partially covers an existing area.
    pub fn mprotect(
        &mut self,
        start: VirtAddr,
        size: u64,
        new_flags: VmaFlags,
    ) -> Result<(), VmmError> {
        let aligned_size = page_align_up(size);
        if aligned_size == 0 {
            return Ok(());
        }
        let start_addr = start.as_u64();
        let end_addr = start_addr + aligned_size;

        let mut new_areas: ArrayVec<VMArea, MAX_VMAS> = ArrayVec::new();
        let mut touched = false;

        for i in 0..self.areas.len() {
            let area = self.areas[i];
            if !area.overlaps(start_addr, end_addr) {
                new_areas
                    .try_push(area)
                    .map_err(|_| VmmError::AreaListFull)?;
                continue;
            }
            touched = true;

            let overlap_start = core::cmp::max(area.start.as_u64(), start_addr);
            let overlap_end = core::cmp::min(area.end.as_u64(), end_addr);

            if area.start.as_u64() < overlap_start {
                new_areas
                    .try_push(VMArea {
                        start: area.start,
                        end: VirtAddr::new_truncate(overlap_start),
                        flags: area.flags,
                    })
                    .map_err(|_| VmmError::AreaListFull)?;
            }

            let mut addr = overlap_start;
            while addr < overlap_end {
                let page = Page::<Size4KiB>::containing_address(VirtAddr::new_truncate(addr));
                // SAFETY: root_phys is this address space's own PML4.
                let flush = unsafe {
                    self.mapper
                        .update_flags(self.root_phys, page, new_flags.to_map_flags() | MapFlags::USER)
                        .map_err(|e| match e {
                            UnmapError::NotMapped => VmmError::NotMapped,
                            UnmapError::SizeMismatch => VmmError::SizeMismatch,
                        })?
                };
                flush.flush();
                addr += PAGE_SIZE as u64;
            }

            new_areas
                .try_push(VMArea {
                    start: VirtAddr::new_truncate(overlap_start),
                    end: VirtAddr::new_truncate(overlap_end),
                    flags: new_flags,
                })
                .map_err(|_| VmmError::AreaListFull)?;

            if overlap_end < area.end.as_u64() {
                new_areas
                    .try_push(VMArea {
                        start: VirtAddr::new_truncate(overlap_end),
                        end: area.end,
                        flags: area.flags,
                    })
                    .map_err(|_| VmmError::AreaListFull)?;
            }
        }

        if !touched {
            return Err(VmmError::NoSuchArea);
        }

        self.areas = new_areas;
        Ok(())
    }

    /// Finds a free range of `size` bytes: uses `hint` if it names a free,
    /// in-bounds range, otherwise scans upward from [`USER_SPACE_BASE`] in
    /// [`MMAP_SCAN_STRIDE`] steps. Maps the chosen range via `map_region`.
    pub fn mmap(
        &mut self,
        hint: VirtAddr,
        size: u64,
        flags: VmaFlags,
        alloc: &mut impl FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    ) -> Result<VirtAddr, VmmError> {
        let aligned_size = page_align_up(size);
        if aligned_size == 0 {
            return Err(VmmError::RegionExhausted);
        }

        let hint_addr = hint.as_u64();
        let hint_fits = hint_addr >= USER_SPACE_BASE
            && hint_addr + aligned_size <= USER_SPACE_END
            && self.range_is_free(hint_addr, aligned_size);

        let chosen = if hint_fits {
            hint
        } else {
            self.find_free_range(aligned_size)
                .ok_or(VmmError::RegionExhausted)?
        };

        self.map_region(chosen, aligned_size, flags, alloc)?;
        Ok(chosen)
    }

    /// Scans upward from [`USER_SPACE_BASE`] for the first gap of `size`
    /// bytes below [`USER_SPACE_END`].
    fn find_free_range(&self, size: u64) -> Option<VirtAddr> {
        let mut candidate = USER_SPACE_BASE;
        while candidate + size <= USER_SPACE_END {
            if self.range_is_free(candidate, size) {
                return Some(VirtAddr::new_truncate(candidate));
            }
            candidate += MMAP_SCAN_STRIDE;
        }
        None
    }

    /// Clones this address space for `fork`: every VMA is duplicated into
    /// `child`, and every present page is shared copy-on-write — the
    /// writable bit is cleared in both page tables, the software `COW` bit
    /// is set in both, and the source's TLB entry for that page is
    /// invalidated.
    ///
    /// Kernel mappings need no attention here: `child` was created via
    /// [`Self::new_user`], which already copied the kernel upper half.
    pub fn clone_into_cow(&mut self, child: &mut AddressSpace<M>) -> Result<(), VmmError> {
        for area in self.areas.as_slice() {
            if child.areas.is_full() {
                return Err(VmmError::AreaListFull);
            }
            let idx = child.insertion_index(area.start.as_u64());
            child.areas.insert(idx, *area);

            let mut addr = area.start.as_u64();
            while addr < area.end.as_u64() {
                let virt = VirtAddr::new_truncate(addr);
                if let Some(phys) = self.translate(virt) {
                    let frame = PhysFrame::<Size4KiB>::containing_address(phys);
                    let page = Page::<Size4KiB>::containing_address(virt);

                    let cow_flags = (area.flags.to_map_flags() | MapFlags::USER | MapFlags::COW)
                        .difference(MapFlags::WRITABLE);

                    // SAFETY: root_phys is this address space's own PML4.
                    unsafe {
                        self.mapper
                            .update_flags(self.root_phys, page, cow_flags)
                            .map_err(|e| match e {
                                UnmapError::NotMapped => VmmError::NotMapped,
                                UnmapError::SizeMismatch => VmmError::SizeMismatch,
                            })?
                            .flush();
                    }

                    // child has no page tables for this frame yet; never
                    // needs an intermediate-table allocator callback beyond
                    // what `map` itself asks for, which we can't service
                    // without a real frame allocator here. Callers therefore
                    // go through `map_user_page` once the child's tables
                    // have been pre-populated for this address range by a
                    // prior `map_region` of the same VMAs — but fork shares
                    // physical frames, not fresh ones, so we map directly.
                    let child_flush = unsafe {
                        child.mapper.map(
                            child.root_phys,
                            page,
                            frame,
                            cow_flags,
                            &mut || panic!("fork: child page tables need an intermediate frame"),
                        )
                    };
                    child_flush.ignore();
                }
                addr += PAGE_SIZE as u64;
            }
        }
        Ok(())
    }

    /// Handles a page fault at `cr2` with the given CPU error code.
    ///
    /// Implements, in order: kernel-address rejection, VMA lookup,
    /// stack-growth within the guard region below a `stack` VMA, COW
    /// write-fault resolution, and demand paging for a non-present address
    /// within a VMA. Anything else is fatal.
    pub fn handle_page_fault(
        &mut self,
        cr2: VirtAddr,
        error_code: PageFaultErrorCode,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> FaultResolution {
        let user_fault = error_code.contains(PageFaultErrorCode::USER);
        if !user_fault && cr2.as_u64() >= USER_SPACE_END {
            return FaultResolution::Fatal;
        }

        if let Some(area) = self.find_area(cr2).copied() {
            return self.handle_fault_in_area(cr2, error_code, &area, alloc);
        }

        // Not inside any VMA: maybe a downward stack-growth fault.
        if let Some(idx) = self.stack_area_above(cr2) {
            return self.grow_stack(idx, cr2, alloc);
        }

        FaultResolution::Fatal
    }

    fn handle_fault_in_area(
        &mut self,
        cr2: VirtAddr,
        error_code: PageFaultErrorCode,
        area: &VMArea,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> FaultResolution {
        let page = Page::<Size4KiB>::containing_address(cr2);

        if error_code.contains(PageFaultErrorCode::PRESENT) {
            if !error_code.contains(PageFaultErrorCode::WRITE) {
                return FaultResolution::Fatal;
            }
            // Present + write fault: must be COW, otherwise a genuine
            // protection violation (e.g. write to a read-only mapping).
            let existing = unsafe {
                <M as PageTranslator>::translate_flags(&self.mapper, self.root_phys, cr2)
            };
            if existing.is_none_or(|f| !f.contains(MapFlags::COW)) {
                return FaultResolution::Fatal;
            }
            return self.resolve_cow(page, area.flags, alloc);
        }

        // Non-present fault within a VMA: demand-page a fresh zeroed frame.
        let frame = match alloc.allocate_frame() {
            Some(f) => f,
            None => return FaultResolution::Fatal,
        };
        unsafe {
            crate::zero_frame((self.hhdm_offset + frame.start_address().as_u64()) as *mut u8);
        }
        match self.map_user_page(page, frame, area.flags.to_map_flags(), alloc) {
            Ok(flush) => {
                flush.flush();
                FaultResolution::Resolved
            }
            Err(_) => FaultResolution::Fatal,
        }
    }

    fn resolve_cow(
        &mut self,
        page: Page<Size4KiB>,
        area_flags: VmaFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> FaultResolution {
        let old_phys = match self.translate(page.start_address()) {
            Some(p) => p,
            None => return FaultResolution::Fatal,
        };

        let new_frame = match alloc.allocate_frame() {
            Some(f) => f,
            None => return FaultResolution::Fatal,
        };

        // SAFETY: both addresses are reachable through the HHDM and
        // `new_frame` is exclusively owned by this operation.
        unsafe {
            let src = (self.hhdm_offset + old_phys.as_u64()) as *const u8;
            let dst = (self.hhdm_offset + new_frame.start_address().as_u64()) as *mut u8;
            core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
        }

        // Replace the mapping: unmap the shared (now stale) entry, map the
        // new private copy writable with COW cleared.
        if self.unmap_user_page(page).is_err() {
            return FaultResolution::Fatal;
        }
        match self.map_user_page(page, new_frame, area_flags.to_map_flags(), alloc) {
            Ok(flush) => {
                flush.flush();
                FaultResolution::Resolved
            }
            Err(_) => FaultResolution::Fatal,
        }
    }

    /// Index of a `stack`-flagged VMA whose guard region (the
    /// `STACK_GROWTH_PAGES` pages immediately below it) contains `addr`.
    fn stack_area_above(&self, addr: VirtAddr) -> Option<usize> {
        let guard_bytes = STACK_GROWTH_PAGES * PAGE_SIZE as u64;
        self.areas.as_slice().iter().position(|a| {
            a.flags.contains(VmaFlags::STACK)
                && addr.as_u64() < a.start.as_u64()
                && addr.as_u64() + guard_bytes >= a.start.as_u64()
        })
    }

    fn grow_stack(
        &mut self,
        idx: usize,
        cr2: VirtAddr,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> FaultResolution {
        let old_start = self.areas[idx].start;
        let new_start = cr2.align_down(PAGE_SIZE as u64);
        let flags = self.areas[idx].flags;

        let mut addr = new_start.as_u64();
        while addr < old_start.as_u64() {
            let page = Page::<Size4KiB>::containing_address(VirtAddr::new_truncate(addr));
            let frame = match alloc.allocate_frame() {
                Some(f) => f,
                None => return FaultResolution::Fatal,
            };
            unsafe {
                crate::zero_frame((self.hhdm_offset + frame.start_address().as_u64()) as *mut u8);
            }
            match self.map_user_page(page, frame, flags.to_map_flags(), alloc) {
                Ok(flush) => flush.flush(),
                Err(_) => return FaultResolution::Fatal,
            }
            addr += PAGE_SIZE as u64;
        }

        self.areas[idx].start = new_start;
        FaultResolution::Resolved
    }

    /// Validates that `[ptr, ptr+len)` lies strictly within user space and
    /// is covered end-to-end by VMAs carrying `required`. Used by the
    /// syscall layer before `copy_from_user`/`copy_to_user`.
    pub fn validate_user_range(&self, ptr: VirtAddr, len: usize, required: VmaFlags) -> bool {
        if len == 0 {
            return ptr.as_u64() >= USER_SPACE_BASE && ptr.as_u64() < USER_SPACE_END;
        }
        let start = ptr.as_u64();
        let end = match start.checked_add(len as u64) {
            Some(e) => e,
            None => return false,
        };
        if start < USER_SPACE_BASE || end > USER_SPACE_END {
            return false;
        }

        let mut cursor = start;
        while cursor < end {
            let addr = VirtAddr::new_truncate(cursor);
            let area = match self.find_area(addr) {
                Some(a) => a,
                None => return false,
            };
            if !area.flags.contains(required) {
                return false;
            }
            cursor = area.end.as_u64();
        }
        true
    }

    /// Copies `len` bytes from a validated user range into `dst`.
    ///
    /// Returns `false` ("bad address") if the range fails validation.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes of writes.
    pub unsafe fn copy_from_user(&self, src: VirtAddr, dst: *mut u8, len: usize) -> bool {
        if !self.validate_user_range(src, len, VmaFlags::READ) {
            return false;
        }
        // SAFETY: validated above; the range is backed by present,
        // readable user mappings reachable at their own virtual addresses
        // (identity within the address space, not via HHDM).
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst, len);
        }
        true
    }

    /// Copies `len` bytes from `src` into a validated user range.
    ///
    /// Returns `false` ("bad address") if the range fails validation.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` bytes of reads.
    pub unsafe fn copy_to_user(&self, dst: VirtAddr, src: *const u8, len: usize) -> bool {
        if !self.validate_user_range(dst, len, VmaFlags::WRITE) {
            return false;
        }
        // SAFETY: validated above.
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr::<u8>(), len);
        }
        true
    }

    /// Copies a NUL-terminated string from user space into `dst`, validating
    /// one byte at a time. Fails ("name too long") if no NUL is found within
    /// `dst.len()` bytes, or ("bad address") if a byte is unmapped/unreadable.
    pub fn copy_user_cstring(&self, src: VirtAddr, dst: &mut [u8]) -> Result<usize, VmmError> {
        for (i, slot) in dst.iter_mut().enumerate() {
            let addr = VirtAddr::new_truncate(src.as_u64() + i as u64);
            if !self.validate_user_range(addr, 1, VmaFlags::READ) {
                return Err(VmmError::NotMapped);
            }
            // SAFETY: validated above.
            let byte = unsafe { core::ptr::read(addr.as_ptr::<u8>()) };
            *slot = byte;
            if byte == 0 {
                return Ok(i);
            }
        }
        Err(VmmError::RegionExhausted)
    }
}

impl<M: PageMapper<Size4KiB> + PageTranslator> Drop for AddressSpace<M> {
    fn drop(&mut self) {
        let frame = PhysFrame::containing_address(self.root_phys);
        (self.dealloc_fn)(frame);
    }
}
