//! Per-process capability spaces.
//!
//! Distinct from driver-authorization capabilities (IRQ/MMIO/DMA ownership
//! tokens handed to device-driver processes): this is the IPC object-access
//! model described in §4.8 — a fixed slot table gating what every endpoint,
//! notification, or other kernel object a process can name, with what
//! rights, entirely independent of the driver-capability mechanism.

use core::sync::atomic::{AtomicU32, Ordering};

use ferrite_core::id::EndpointId;
use ferrite_core::sync::SpinLock;

use crate::error::IpcError;

/// Upper bound on capability slots per process. Matches the message
/// format's 4-bit cap-count field's natural working set with headroom.
pub const MAX_SLOTS: usize = 128;

bitflags::bitflags! {
    /// Rights a capability carries, gating which operations it authorizes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        /// May `ipc_send`/`ipc_recv` through the referenced endpoint.
        const SEND    = 1 << 0;
        /// May receive on the referenced endpoint.
        const RECV    = 1 << 1;
        /// May `copy`/`mint` this capability to another slot or space.
        const GRANT   = 1 << 2;
        /// May `revoke` capabilities derived from this one.
        const REVOKE  = 1 << 3;
    }
}

/// What kind of kernel object a capability refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    /// A message endpoint.
    Endpoint(EndpointId),
    /// A notification object, identified the same way as an endpoint (the
    /// two share an ID namespace; see [`crate::endpoint::EndpointFlags::NOTIFICATION`]).
    Notification(EndpointId),
}

/// A single capability: kind, rights, user-visible badge, and the
/// generation it was minted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    kind: CapKind,
    rights: Rights,
    badge: u64,
    generation: u32,
}

impl Capability {
    /// The kind of object this capability names.
    pub fn kind(&self) -> CapKind {
        self.kind
    }

    /// The rights this capability grants.
    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// The user-supplied badge, set by [`CapabilitySpace::mint`], zero for
    /// a plain `insert`/`copy`.
    pub fn badge(&self) -> u64 {
        self.badge
    }
}

#[derive(Clone, Copy)]
struct Slot {
    cap: Capability,
    occupied: bool,
}

impl Slot {
    const EMPTY: Self = Self {
        cap: Capability {
            kind: CapKind::Endpoint(EndpointId::new(0)),
            rights: Rights::empty(),
            badge: 0,
            generation: 0,
        },
        occupied: false,
    };
}

struct CapabilitySpaceInner {
    slots: [Slot; MAX_SLOTS],
    generation: u32,
}

/// A per-process table of capability slots.
///
/// `revoke` is coarse: it bumps the space's generation counter rather than
/// walking a derivation tree, so any *cached* capability reference whose
/// recorded generation predates the bump reads as stale on its next
/// `lookup` — occupied slots in the table itself are untouched by revoke
/// and must be `delete`d explicitly to actually free them. A derivation
/// tree for fine-grained revoke is future work (see the design notes this
/// crate was built against).
pub struct CapabilitySpace {
    inner: SpinLock<CapabilitySpaceInner>,
    /// Monotonic counter for deriving this space's memory address into a
    /// stable lock-ordering key, used by `lock_ordered_pair`.
    ordering_key: AtomicU32,
}

impl CapabilitySpace {
    /// Creates an empty capability space.
    pub fn new() -> Self {
        static NEXT_ORDERING_KEY: AtomicU32 = AtomicU32::new(1);
        Self {
            inner: SpinLock::new(CapabilitySpaceInner {
                slots: [Slot::EMPTY; MAX_SLOTS],
                generation: 0,
            }),
            ordering_key: AtomicU32::new(NEXT_ORDERING_KEY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Finds a free slot, writes `kind`/`rights`/`badge`, stamps it with
    /// the space's current generation, and returns the slot index.
    pub fn insert(&self, kind: CapKind, rights: Rights, badge: u64) -> Result<u32, IpcError> {
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        let slot = inner
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.occupied)
            .ok_or(IpcError::Overflow)?;
        let (idx, slot) = slot;
        slot.cap = Capability {
            kind,
            rights,
            badge,
            generation,
        };
        slot.occupied = true;
        Ok(idx as u32)
    }

    /// Returns the capability at `slot`, if occupied and not stale
    /// (its recorded generation matches or postdates the space's
    /// current generation at the time of the last bulk revoke).
    pub fn lookup(&self, slot: u32) -> Result<Capability, IpcError> {
        let inner = self.inner.lock();
        let entry = inner.slots.get(slot as usize).ok_or(IpcError::Invalid)?;
        if !entry.occupied {
            return Err(IpcError::Invalid);
        }
        if entry.cap.generation < inner.generation {
            return Err(IpcError::Invalid);
        }
        Ok(entry.cap)
    }

    /// Zeros and frees `slot`.
    pub fn delete(&self, slot: u32) -> Result<(), IpcError> {
        let mut inner = self.inner.lock();
        let entry = inner.slots.get_mut(slot as usize).ok_or(IpcError::Invalid)?;
        if !entry.occupied {
            return Err(IpcError::Invalid);
        }
        *entry = Slot::EMPTY;
        Ok(())
    }

    /// Copies the capability at `src_slot` into a free slot in `dest`,
    /// with identical rights and kind. Requires the source to bear
    /// [`Rights::GRANT`].
    pub fn copy(&self, src_slot: u32, dest: &CapabilitySpace) -> Result<u32, IpcError> {
        let cap = self.lookup(src_slot)?;
        if !cap.rights.contains(Rights::GRANT) {
            return Err(IpcError::Permission);
        }
        dest.insert(cap.kind, cap.rights, cap.badge)
    }

    /// `copy` with a rights mask intersected against the source's rights
    /// and a caller-supplied badge, as used to mint a distinguishable
    /// capability for a specific client.
    pub fn mint(&self, src_slot: u32, dest: &CapabilitySpace, reduced_rights: Rights, badge: u64) -> Result<u32, IpcError> {
        let cap = self.lookup(src_slot)?;
        if !cap.rights.contains(Rights::GRANT) {
            return Err(IpcError::Permission);
        }
        let rights = cap.rights.intersection(reduced_rights);
        dest.insert(cap.kind, rights, badge)
    }

    /// Bumps this space's generation counter, invalidating every
    /// capability whose recorded generation is now stale on next
    /// `lookup`. Requires the caller to already hold a capability with
    /// [`Rights::REVOKE`] over the space (enforced by the syscall layer,
    /// not by this type, since revocation is space-wide rather than
    /// per-capability here).
    pub fn revoke(&self) {
        let mut inner = self.inner.lock();
        inner.generation = inner.generation.wrapping_add(1);
    }

    /// Number of occupied slots.
    pub fn occupied_count(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.occupied).count()
    }

    /// A stable ordering key for this space, used to decide acquisition
    /// order when an operation (copy, mint) must lock two spaces at once.
    /// Per §5's "acquire in increasing memory-address order" rule,
    /// generalized here to an explicit counter so it doesn't depend on
    /// comparing raw pointers.
    pub fn ordering_key(&self) -> u32 {
        self.ordering_key.load(Ordering::Relaxed)
    }
}

impl Default for CapabilitySpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks `a` and `b` in a consistent order (by [`CapabilitySpace::ordering_key`])
/// regardless of call-site argument order, preventing the classic two-lock
/// deadlock a naive `a.lock(); b.lock();` would risk for a cross-space
/// `copy`/`mint` racing the reverse direction concurrently.
pub fn lock_ordered_pair<'a>(a: &'a CapabilitySpace, b: &'a CapabilitySpace) -> (&'a CapabilitySpace, &'a CapabilitySpace) {
    if a.ordering_key() <= b.ordering_key() {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_roundtrip() {
        let space = CapabilitySpace::new();
        let slot = space
            .insert(CapKind::Endpoint(EndpointId::new(7)), Rights::SEND | Rights::GRANT, 0)
            .unwrap();
        let cap = space.lookup(slot).unwrap();
        assert_eq!(cap.kind(), CapKind::Endpoint(EndpointId::new(7)));
        assert_eq!(cap.rights(), Rights::SEND | Rights::GRANT);
    }

    #[test]
    fn lookup_of_empty_slot_fails() {
        let space = CapabilitySpace::new();
        assert_eq!(space.lookup(0), Err(IpcError::Invalid));
    }

    #[test]
    fn delete_frees_the_slot() {
        let space = CapabilitySpace::new();
        let slot = space.insert(CapKind::Endpoint(EndpointId::new(1)), Rights::SEND, 0).unwrap();
        space.delete(slot).unwrap();
        assert_eq!(space.lookup(slot), Err(IpcError::Invalid));
    }

    #[test]
    fn copy_requires_grant_right() {
        let src = CapabilitySpace::new();
        let dst = CapabilitySpace::new();
        let slot = src.insert(CapKind::Endpoint(EndpointId::new(1)), Rights::SEND, 0).unwrap();
        assert_eq!(src.copy(slot, &dst), Err(IpcError::Permission));
    }

    #[test]
    fn copy_with_grant_right_succeeds_and_preserves_rights() {
        let src = CapabilitySpace::new();
        let dst = CapabilitySpace::new();
        let slot = src
            .insert(CapKind::Endpoint(EndpointId::new(1)), Rights::SEND | Rights::GRANT, 0)
            .unwrap();
        let dst_slot = src.copy(slot, &dst).unwrap();
        let cap = dst.lookup(dst_slot).unwrap();
        assert_eq!(cap.rights(), Rights::SEND | Rights::GRANT);
    }

    #[test]
    fn mint_reduces_rights_and_sets_badge() {
        let src = CapabilitySpace::new();
        let dst = CapabilitySpace::new();
        let slot = src
            .insert(CapKind::Endpoint(EndpointId::new(1)), Rights::SEND | Rights::RECV | Rights::GRANT, 0)
            .unwrap();
        let dst_slot = src.mint(slot, &dst, Rights::SEND, 0xBADE).unwrap();
        let cap = dst.lookup(dst_slot).unwrap();
        assert_eq!(cap.rights(), Rights::SEND);
        assert_eq!(cap.badge(), 0xBADE);
    }

    #[test]
    fn revoke_invalidates_existing_slots_on_next_lookup() {
        let space = CapabilitySpace::new();
        let slot = space.insert(CapKind::Endpoint(EndpointId::new(1)), Rights::SEND, 0).unwrap();
        space.revoke();
        assert_eq!(space.lookup(slot), Err(IpcError::Invalid));
    }

    #[test]
    fn insert_after_revoke_is_valid_again() {
        let space = CapabilitySpace::new();
        space.revoke();
        let slot = space.insert(CapKind::Endpoint(EndpointId::new(2)), Rights::SEND, 0).unwrap();
        assert!(space.lookup(slot).is_ok());
    }

    #[test]
    fn lock_ordered_pair_is_consistent_regardless_of_argument_order() {
        let a = CapabilitySpace::new();
        let b = CapabilitySpace::new();
        let (first_ab, second_ab) = lock_ordered_pair(&a, &b);
        let (first_ba, second_ba) = lock_ordered_pair(&b, &a);
        assert_eq!(first_ab.ordering_key(), first_ba.ordering_key());
        assert_eq!(second_ab.ordering_key(), second_ba.ordering_key());
    }

    #[test]
    fn insert_fails_once_space_is_full() {
        let space = CapabilitySpace::new();
        for _ in 0..MAX_SLOTS {
            space.insert(CapKind::Endpoint(EndpointId::new(0)), Rights::SEND, 0).unwrap();
        }
        assert_eq!(
            space.insert(CapKind::Endpoint(EndpointId::new(0)), Rights::SEND, 0),
            Err(IpcError::Overflow)
        );
    }
}
