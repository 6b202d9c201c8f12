//! Minimal ELF64 loader for `exec()`.
//!
//! Parses just enough of the format to load a statically linked,
//! non-relocatable executable: the file header, the `PT_LOAD` program
//! headers, and nothing else. No dynamic linking, no section headers, no
//! relocations.

use ferrite_core::addr::VirtAddr;
use ferrite_core::paging::Size4KiB;
use ferrite_mm::address_space::{AddressSpace, VmaFlags};
use ferrite_mm::mapper::{PageMapper, PageTranslator};
use ferrite_mm::{FrameAllocator, FrameDeallocator, VmmError};

const EI_NIDENT: usize = 16;
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

/// Why an ELF image was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Too short to contain a header, or the magic number didn't match.
    NotElf,
    /// Not ELFCLASS64 / ELFDATA2LSB.
    WrongClass,
    /// Not `EM_X86_64`, or not `ET_EXEC`/`ET_DYN`.
    WrongMachine,
    /// Program header table runs past the end of the image.
    Truncated,
    /// A `PT_LOAD` segment could not be mapped.
    MapFailed(VmmError),
}

impl From<VmmError> for ElfError {
    fn from(e: VmmError) -> Self {
        ElfError::MapFailed(e)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Result of a successful load: where execution should begin.
#[derive(Debug, Clone, Copy)]
pub struct LoadedElf {
    /// Entry point virtual address.
    pub entry: VirtAddr,
}

fn read_ehdr(image: &[u8]) -> Result<Elf64Ehdr, ElfError> {
    if image.len() < core::mem::size_of::<Elf64Ehdr>() {
        return Err(ElfError::NotElf);
    }
    // SAFETY: length checked above; Elf64Ehdr has no padding-sensitive
    // invariants and every bit pattern is valid for its plain-data fields.
    let ehdr = unsafe { core::ptr::read_unaligned(image.as_ptr().cast::<Elf64Ehdr>()) };
    if ehdr.e_ident[0..4] != ELF_MAGIC {
        return Err(ElfError::NotElf);
    }
    if ehdr.e_ident[4] != ELFCLASS64 || ehdr.e_ident[5] != ELFDATA2LSB {
        return Err(ElfError::WrongClass);
    }
    if ehdr.e_machine != EM_X86_64 || (ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN) {
        return Err(ElfError::WrongMachine);
    }
    Ok(ehdr)
}

/// Loads every `PT_LOAD` segment of `image` into `space`, zero-filling BSS
/// tail bytes and copying file contents page by page.
///
/// Returns the entry point on success. `space` is left partially populated
/// on failure; callers discard it rather than attempting to unwind.
pub fn load<M>(
    space: &mut AddressSpace<M>,
    image: &[u8],
    alloc: &mut (impl FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>),
) -> Result<LoadedElf, ElfError>
where
    M: PageMapper<Size4KiB> + PageTranslator,
{
    let ehdr = read_ehdr(image)?;
    let phentsize = ehdr.e_phentsize as usize;
    let phnum = ehdr.e_phnum as usize;
    let phoff = ehdr.e_phoff as usize;
    let phdr_bytes = phentsize.saturating_mul(phnum);
    if phoff.saturating_add(phdr_bytes) > image.len() {
        return Err(ElfError::Truncated);
    }

    for i in 0..phnum {
        let off = phoff + i * phentsize;
        if off + core::mem::size_of::<Elf64Phdr>() > image.len() {
            return Err(ElfError::Truncated);
        }
        // SAFETY: bounds checked above.
        let phdr = unsafe { core::ptr::read_unaligned(image[off..].as_ptr().cast::<Elf64Phdr>()) };
        if phdr.p_type != PT_LOAD {
            continue;
        }
        load_segment(space, image, &phdr, alloc)?;
    }

    Ok(LoadedElf {
        entry: VirtAddr::new_truncate(ehdr.e_entry),
    })
}

fn load_segment<M>(
    space: &mut AddressSpace<M>,
    image: &[u8],
    phdr: &Elf64Phdr,
    alloc: &mut (impl FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>),
) -> Result<(), ElfError>
where
    M: PageMapper<Size4KiB> + PageTranslator,
{
    const PAGE_SIZE: u64 = 4096;

    let vaddr = phdr.p_vaddr;
    let vaddr_aligned = vaddr & !(PAGE_SIZE - 1);
    let offset_in_page = vaddr - vaddr_aligned;
    let memsz_aligned = (phdr.p_memsz + offset_in_page).div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let mut vma_flags = VmaFlags::ANONYMOUS;
    if phdr.p_flags & PF_R != 0 {
        vma_flags |= VmaFlags::READ;
    }
    if phdr.p_flags & PF_W != 0 {
        vma_flags |= VmaFlags::WRITE;
    }
    if phdr.p_flags & PF_X != 0 {
        vma_flags |= VmaFlags::EXECUTE;
    }

    space.map_region(
        VirtAddr::new_truncate(vaddr_aligned),
        memsz_aligned,
        vma_flags,
        alloc,
    )?;

    let file_start = phdr.p_offset as usize;
    let file_end = file_start + phdr.p_filesz as usize;
    if file_end > image.len() {
        return Err(ElfError::Truncated);
    }
    let file_bytes = &image[file_start..file_end];

    let mut written = 0u64;
    while written < phdr.p_filesz {
        let dst_vaddr = VirtAddr::new_truncate(vaddr + written);
        let Some(dst_phys) = space.translate(dst_vaddr) else {
            return Err(ElfError::MapFailed(VmmError::NotMapped));
        };
        let remaining_in_page = PAGE_SIZE - (dst_vaddr.as_u64() & (PAGE_SIZE - 1));
        let chunk = remaining_in_page.min(phdr.p_filesz - written) as usize;
        let hhdm = ferrite_mm::hhdm::offset();
        let dst_ptr = (hhdm + dst_phys.as_u64()) as *mut u8;
        let src = &file_bytes[written as usize..written as usize + chunk];
        // SAFETY: dst_phys was just mapped by map_region and is reachable
        // through the HHDM; src is within image's bounds.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst_ptr, chunk);
        }
        written += chunk as u64;
    }

    Ok(())
}

/// A named ELF image compiled into the kernel image, looked up by `exec()`
/// in lieu of a filesystem. Mirrors the kernel's own bootstrap needs (the
/// initial handful of servers) rather than a general loader policy.
pub struct EmbeddedBinary {
    /// Name matched against the last path component `exec()` is given.
    pub name: &'static str,
    /// Raw ELF64 bytes.
    pub image: &'static [u8],
}

/// The fixed table of binaries `exec()` can launch. Empty until a real
/// bootstrap server is embedded; populated at link time via `include_bytes!`
/// once one exists.
pub static EMBEDDED_BINARIES: &[EmbeddedBinary] = &[];

/// Looks up an embedded binary by the final path component of `path`
/// (`/sbin/init` and `init` both match a binary named `init`).
pub fn find_embedded(path: &str) -> Option<&'static [u8]> {
    let name = path.rsplit('/').next().unwrap_or(path);
    EMBEDDED_BINARIES
        .iter()
        .find(|b| b.name == name)
        .map(|b| b.image)
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;
    use std::cell::RefCell;
    use std::sync::Once;
    use std::vec::Vec;

    use super::*;
    use ferrite_core::addr::PhysAddr;
    use ferrite_core::paging::{Page, PhysFrame};
    use ferrite_mm::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, UnmapError};

    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;

    fn write_ehdr(buf: &mut Vec<u8>, e_type: u16, e_machine: u16, e_entry: u64, phoff: u64, phentsize: u16, phnum: u16) {
        buf.resize(EHDR_SIZE, 0);
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[16..18].copy_from_slice(&e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&e_machine.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        buf[24..32].copy_from_slice(&e_entry.to_le_bytes());
        buf[32..40].copy_from_slice(&phoff.to_le_bytes());
        buf[40..48].copy_from_slice(&0u64.to_le_bytes()); // e_shoff
        buf[48..52].copy_from_slice(&0u32.to_le_bytes()); // e_flags
        buf[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        buf[54..56].copy_from_slice(&phentsize.to_le_bytes());
        buf[56..58].copy_from_slice(&phnum.to_le_bytes());
        buf[58..60].copy_from_slice(&0u16.to_le_bytes()); // e_shentsize
        buf[60..62].copy_from_slice(&0u16.to_le_bytes()); // e_shnum
        buf[62..64].copy_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    }

    fn write_phdr(buf: &mut Vec<u8>, p_type: u32, p_flags: u32, p_offset: u64, p_vaddr: u64, p_filesz: u64, p_memsz: u64) {
        let start = buf.len();
        buf.resize(start + PHDR_SIZE, 0);
        buf[start..start + 4].copy_from_slice(&p_type.to_le_bytes());
        buf[start + 4..start + 8].copy_from_slice(&p_flags.to_le_bytes());
        buf[start + 8..start + 16].copy_from_slice(&p_offset.to_le_bytes());
        buf[start + 16..start + 24].copy_from_slice(&p_vaddr.to_le_bytes());
        buf[start + 24..start + 32].copy_from_slice(&p_vaddr.to_le_bytes()); // p_paddr
        buf[start + 32..start + 40].copy_from_slice(&p_filesz.to_le_bytes());
        buf[start + 40..start + 48].copy_from_slice(&p_memsz.to_le_bytes());
        buf[start + 48..start + 56].copy_from_slice(&8u64.to_le_bytes()); // p_align
    }

    #[test]
    fn truncated_header_is_rejected() {
        let buf = vec![0u8; EHDR_SIZE - 1];
        assert_eq!(read_ehdr(&buf), Err(ElfError::NotElf));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        write_ehdr(&mut buf, ET_EXEC, EM_X86_64, 0, EHDR_SIZE as u64, PHDR_SIZE as u16, 0);
        buf[0] = 0; // clobber the magic
        assert_eq!(read_ehdr(&buf), Err(ElfError::NotElf));
    }

    #[test]
    fn wrong_machine_is_rejected() {
        let mut buf = Vec::new();
        write_ehdr(&mut buf, ET_EXEC, EM_X86_64 + 1, 0, EHDR_SIZE as u64, PHDR_SIZE as u16, 0);
        assert_eq!(read_ehdr(&buf), Err(ElfError::WrongMachine));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut buf = Vec::new();
        write_ehdr(&mut buf, 0 /* ET_NONE */, EM_X86_64, 0, EHDR_SIZE as u64, PHDR_SIZE as u16, 0);
        assert_eq!(read_ehdr(&buf), Err(ElfError::WrongMachine));
    }

    #[test]
    fn valid_header_parses() {
        let mut buf = Vec::new();
        write_ehdr(&mut buf, ET_EXEC, EM_X86_64, 0x1000, EHDR_SIZE as u64, PHDR_SIZE as u16, 0);
        let ehdr = read_ehdr(&buf).unwrap();
        assert_eq!(ehdr.e_entry, 0x1000);
        assert_eq!(ehdr.e_phnum, 0);
    }

    // --- `load()` happy path: a fake address space backed by a leaked host
    // buffer standing in for physical memory, mirroring the HHDM-backed
    // `AddressSpace` the real loader writes through. ---

    static HHDM_INIT: Once = Once::new();

    fn ensure_hhdm() {
        HHDM_INIT.call_once(|| {
            let size = 1024 * 1024;
            let layout = Layout::from_size_align(size, 4096).unwrap();
            // SAFETY: leaked for the lifetime of the test binary, used only
            // as a stand-in for physical memory addressed through HHDM.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            ferrite_mm::hhdm::init(ptr as u64);
        });
    }

    /// Bump-allocates 4 KiB frames as offsets into the HHDM-backed buffer.
    /// Frame 0 is reserved for the fake kernel PML4 so user allocations never
    /// collide with it.
    struct TestFrames {
        next: u64,
    }

    impl TestFrames {
        fn new() -> Self {
            Self { next: 1 }
        }
    }

    unsafe impl ferrite_mm::FrameAllocator<Size4KiB> for TestFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            let frame = PhysFrame::from_start_address(PhysAddr::new(self.next * 4096)).ok()?;
            self.next += 1;
            Some(frame)
        }
    }

    unsafe impl ferrite_mm::FrameDeallocator<Size4KiB> for TestFrames {
        unsafe fn deallocate_frame(&mut self, _frame: PhysFrame<Size4KiB>) {}
    }

    /// A flat page table: every mapping lives in one Vec regardless of
    /// `root`, since these tests only ever exercise a single address space.
    struct TestMapper {
        entries: RefCell<Vec<(u64, u64, MapFlags)>>,
    }

    impl TestMapper {
        fn new() -> Self {
            Self { entries: RefCell::new(Vec::new()) }
        }
    }

    unsafe impl PageMapper<Size4KiB> for TestMapper {
        unsafe fn map(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
            frame: PhysFrame<Size4KiB>,
            flags: MapFlags,
            _alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
        ) -> MapFlush {
            let key = page.start_address().as_u64();
            let mut entries = self.entries.borrow_mut();
            entries.retain(|(p, _, _)| *p != key);
            entries.push((key, frame.start_address().as_u64(), flags));
            MapFlush::new(page.start_address())
        }

        unsafe fn unmap(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
        ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError> {
            let key = page.start_address().as_u64();
            let mut entries = self.entries.borrow_mut();
            let idx = entries.iter().position(|(p, _, _)| *p == key).ok_or(UnmapError::NotMapped)?;
            let (_, frame_addr, _) = entries.remove(idx);
            let frame = PhysFrame::from_start_address(PhysAddr::new_truncate(frame_addr)).unwrap();
            Ok((frame, MapFlush::new(page.start_address())))
        }

        unsafe fn update_flags(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
            flags: MapFlags,
        ) -> Result<MapFlush, UnmapError> {
            let key = page.start_address().as_u64();
            let mut entries = self.entries.borrow_mut();
            let entry = entries.iter_mut().find(|(p, _, _)| *p == key).ok_or(UnmapError::NotMapped)?;
            entry.2 = flags;
            Ok(MapFlush::new(page.start_address()))
        }
    }

    unsafe impl PageTranslator for TestMapper {
        unsafe fn translate_addr(&self, _root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
            let page_start = virt.as_u64() & !0xFFF;
            let offset = virt.as_u64() & 0xFFF;
            let entries = self.entries.borrow();
            entries
                .iter()
                .find(|(p, _, _)| *p == page_start)
                .map(|(_, f, _)| PhysAddr::new_truncate(f + offset))
        }

        unsafe fn translate_flags(&self, _root: PhysAddr, virt: VirtAddr) -> Option<MapFlags> {
            let page_start = virt.as_u64() & !0xFFF;
            let entries = self.entries.borrow();
            entries.iter().find(|(p, _, _)| *p == page_start).map(|(_, _, f)| *f)
        }
    }

    #[test]
    fn valid_single_pt_load_segment_is_mapped_and_copied() {
        ensure_hhdm();

        let payload = b"hello, kernel!!!";
        let vaddr = 0x0040_0000u64;
        let file_off = (EHDR_SIZE + PHDR_SIZE) as u64;

        let mut image = Vec::new();
        write_ehdr(&mut image, ET_EXEC, EM_X86_64, vaddr, EHDR_SIZE as u64, PHDR_SIZE as u16, 1);
        write_phdr(&mut image, PT_LOAD, PF_R | PF_W, file_off, vaddr, payload.len() as u64, payload.len() as u64);
        image.extend_from_slice(payload);

        let mapper = TestMapper::new();
        let mut alloc = TestFrames::new();
        let mut space = unsafe {
            AddressSpace::new_user(PhysAddr::new(0), mapper, ferrite_mm::hhdm::offset(), &mut alloc, |_| {})
        }
        .unwrap();

        let loaded = load(&mut space, &image, &mut alloc).unwrap();
        assert_eq!(loaded.entry, VirtAddr::new_truncate(vaddr));

        let phys = space.translate(VirtAddr::new_truncate(vaddr)).unwrap();
        let hhdm = ferrite_mm::hhdm::offset();
        let copied = unsafe { core::slice::from_raw_parts((hhdm + phys.as_u64()) as *const u8, payload.len()) };
        assert_eq!(copied, payload);
    }

    #[test]
    fn truncated_program_header_table_is_rejected() {
        ensure_hhdm();

        let mut image = Vec::new();
        // Claims two program headers but the image only holds room for one.
        write_ehdr(&mut image, ET_EXEC, EM_X86_64, 0x1000, EHDR_SIZE as u64, PHDR_SIZE as u16, 2);
        write_phdr(&mut image, PT_LOAD, PF_R, EHDR_SIZE as u64 + 2 * PHDR_SIZE as u64, 0x1000, 0, 0);

        let mapper = TestMapper::new();
        let mut alloc = TestFrames::new();
        let mut space = unsafe {
            AddressSpace::new_user(PhysAddr::new(0), mapper, ferrite_mm::hhdm::offset(), &mut alloc, |_| {})
        }
        .unwrap();

        assert_eq!(load(&mut space, &image, &mut alloc), Err(ElfError::Truncated));
    }
}
