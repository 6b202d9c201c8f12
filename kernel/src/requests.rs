//! Limine protocol requests this kernel actually consumes.
//!
//! Trimmed relative to a general-purpose bootloader shim: no framebuffer,
//! no SMP, no module/initrd request. Bring-up past this point is single-CPU
//! and framebuffer-free by design; see [`crate::boot::BootInfo`].

use limine::{
    BaseRevision, ExecutableCmdlineRequest, HhdmRequest, MemMapRequest, RequestsEndMarker,
    RequestsStartMarker, RsdpRequest,
};

#[repr(C, align(8))]
pub struct LimineRequests {
    _start_marker: RequestsStartMarker,
    pub base_revision: BaseRevision,
    pub memmap: MemMapRequest,
    pub hhdm: HhdmRequest,
    pub rsdp: RsdpRequest,
    pub cmdline: ExecutableCmdlineRequest,
    _end_marker: RequestsEndMarker,
}

impl LimineRequests {
    const fn new() -> Self {
        Self {
            _start_marker: RequestsStartMarker::new(),
            base_revision: BaseRevision::new(),
            memmap: MemMapRequest::new(),
            hhdm: HhdmRequest::new(),
            rsdp: RsdpRequest::new(),
            cmdline: ExecutableCmdlineRequest::new(),
            _end_marker: RequestsEndMarker::new(),
        }
    }
}

// SAFETY: only ever read from by the bootloader, never mutated after the
// handoff into `_start`.
unsafe impl Sync for LimineRequests {}

#[used]
#[unsafe(link_section = ".requests")]
pub static REQUESTS: LimineRequests = LimineRequests::new();
