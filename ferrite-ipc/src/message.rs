//! The IPC message tag and the fixed-shape message it labels.
//!
//! A message is deliberately small and fixed-size so the fast path (tag plus
//! eight register-width words) never touches an allocator: `ipc_send`/
//! `ipc_recv` copy it straight out of the syscall entry frame's argument
//! registers.

use planck_noalloc::vec::ArrayVec;

use ferrite_core::id::EndpointId;

/// Number of fast-path register-width payload words carried inline in every
/// message.
pub const NUM_REGS: usize = 8;

/// Maximum number of capability slot references a single message can carry.
pub const MAX_CAPS: usize = 16;

/// Maximum size, in bytes, of a message's optional extension buffer.
pub const MAX_EXTENSION_BYTES: usize = 256;

bitflags::bitflags! {
    /// Flags carried in a [`MessageTag`]'s 8-bit flags field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// The sender grants the receiver the right to copy capabilities
        /// out of the message's capability list.
        const GRANT        = 1 << 0;
        /// The sender donates (moves, rather than copies) the listed
        /// capabilities; they no longer exist in the sender's space.
        const DONATE       = 1 << 1;
        /// The caller is willing to block waiting for a partner.
        const BLOCKING     = 1 << 2;
        /// The caller requires an immediate partner or failure; see
        /// [`crate::endpoint::Endpoint::send`]'s non-blocking path.
        const NON_BLOCKING = 1 << 3;
    }
}

/// A packed 64-bit message tag.
///
/// Layout (bit 63 is the high bit): `label[63:44]`, `length[43:38]`,
/// `cap_count[37:34]`, `flags[33:26]`, `error[25:10]`, `reserved[9:0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct MessageTag(u64);

const LABEL_BITS: u32 = 20;
const LENGTH_BITS: u32 = 6;
const CAP_COUNT_BITS: u32 = 4;
const FLAGS_BITS: u32 = 8;
const ERROR_BITS: u32 = 16;

const RESERVED_SHIFT: u32 = 0;
const ERROR_SHIFT: u32 = RESERVED_SHIFT + 10;
const FLAGS_SHIFT: u32 = ERROR_SHIFT + ERROR_BITS;
const CAP_COUNT_SHIFT: u32 = FLAGS_SHIFT + FLAGS_BITS;
const LENGTH_SHIFT: u32 = CAP_COUNT_SHIFT + CAP_COUNT_BITS;
const LABEL_SHIFT: u32 = LENGTH_SHIFT + LENGTH_BITS;

const LABEL_MASK: u64 = (1u64 << LABEL_BITS) - 1;
const LENGTH_MASK: u64 = (1u64 << LENGTH_BITS) - 1;
const CAP_COUNT_MASK: u64 = (1u64 << CAP_COUNT_BITS) - 1;
const FLAGS_MASK: u64 = (1u64 << FLAGS_BITS) - 1;
const ERROR_MASK: u64 = (1u64 << ERROR_BITS) - 1;

impl MessageTag {
    /// Builds a tag from its constituent fields. Out-of-range values are
    /// truncated to their field width rather than rejected, matching the
    /// fixed-width hardware-register feel of the rest of the syscall ABI.
    pub const fn new(label: u32, length: u8, cap_count: u8, flags: MessageFlags) -> Self {
        let bits = ((label as u64 & LABEL_MASK) << LABEL_SHIFT)
            | ((length as u64 & LENGTH_MASK) << LENGTH_SHIFT)
            | ((cap_count as u64 & CAP_COUNT_MASK) << CAP_COUNT_SHIFT)
            | ((flags.bits() as u64 & FLAGS_MASK) << FLAGS_SHIFT);
        Self(bits)
    }

    /// Builds a tag directly from its raw 64-bit encoding, as received over
    /// the syscall ABI.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw 64-bit encoding.
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// The message's 20-bit label (protocol-defined opcode/selector).
    pub const fn label(self) -> u32 {
        ((self.0 >> LABEL_SHIFT) & LABEL_MASK) as u32
    }

    /// Number of valid register-width words in the fast-path payload
    /// (0..=8).
    pub const fn length(self) -> u8 {
        ((self.0 >> LENGTH_SHIFT) & LENGTH_MASK) as u8
    }

    /// Number of valid capability slot references (0..=15).
    pub const fn cap_count(self) -> u8 {
        ((self.0 >> CAP_COUNT_SHIFT) & CAP_COUNT_MASK) as u8
    }

    /// The message's flags.
    pub const fn flags(self) -> MessageFlags {
        MessageFlags::from_bits_truncate(((self.0 >> FLAGS_SHIFT) & FLAGS_MASK) as u8)
    }

    /// The reply error code; zero for a success/request tag, nonzero on a
    /// failed reply.
    pub const fn error(self) -> u16 {
        ((self.0 >> ERROR_SHIFT) & ERROR_MASK) as u16
    }

    /// Returns a copy of this tag with the error field set, for use when
    /// turning a request tag into a reply tag.
    pub const fn with_error(self, error: u16) -> Self {
        let cleared = self.0 & !(ERROR_MASK << ERROR_SHIFT);
        Self(cleared | ((error as u64 & ERROR_MASK) << ERROR_SHIFT))
    }

    /// Returns a copy of this tag with the length field replaced.
    pub const fn with_length(self, length: u8) -> Self {
        let cleared = self.0 & !(LENGTH_MASK << LENGTH_SHIFT);
        Self(cleared | ((length as u64 & LENGTH_MASK) << LENGTH_SHIFT))
    }
}

/// A reference to one of the sender's capability slots, carried in a
/// message's capability list rather than copied eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapTransfer {
    /// Slot index in the sender's capability space.
    pub slot: u32,
}

/// The full fixed-shape IPC message.
///
/// The fast path only ever touches `tag` and `regs`; `extension` and `caps`
/// are populated only when `tag.length()` or `tag.cap_count()` call for it.
#[derive(Debug, Clone, Copy)]
pub struct Message {
    /// The message tag.
    pub tag: MessageTag,
    /// Fast-path register-width payload words, `tag.length()` of which are
    /// meaningful.
    pub regs: [u64; NUM_REGS],
    /// Capability slots referenced by this message, `tag.cap_count()` of
    /// which are meaningful.
    pub caps: [CapTransfer; MAX_CAPS],
    /// The endpoint the receiver should reply to, if this is a `Call`
    /// request; `None` for a one-way send.
    pub reply_to: Option<EndpointId>,
}

impl Message {
    /// Builds an empty message with a zeroed tag and no reply endpoint.
    pub const fn empty() -> Self {
        Self {
            tag: MessageTag::new(0, 0, 0, MessageFlags::empty()),
            regs: [0; NUM_REGS],
            caps: [CapTransfer { slot: 0 }; MAX_CAPS],
            reply_to: None,
        }
    }

    /// Builds a fast-path message carrying only a tag and register payload.
    pub fn fast(tag: MessageTag, regs: [u64; NUM_REGS]) -> Self {
        Self {
            tag,
            regs,
            ..Self::empty()
        }
    }

    /// Copies this message's capability slots into an [`ArrayVec`] for
    /// processing by [`crate::capability::CapabilitySpace`] transfer logic.
    pub fn cap_transfers(&self) -> ArrayVec<CapTransfer, MAX_CAPS> {
        let mut out = ArrayVec::new();
        for i in 0..self.tag.cap_count() as usize {
            let _ = out.insert(out.len(), self.caps[i]);
        }
        out
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_field_roundtrip() {
        let tag = MessageTag::new(100, 2, 3, MessageFlags::GRANT | MessageFlags::BLOCKING);
        assert_eq!(tag.label(), 100);
        assert_eq!(tag.length(), 2);
        assert_eq!(tag.cap_count(), 3);
        assert_eq!(tag.flags(), MessageFlags::GRANT | MessageFlags::BLOCKING);
        assert_eq!(tag.error(), 0);
    }

    #[test]
    fn max_label_fits_20_bits() {
        let tag = MessageTag::new(0xFFFFF, 0, 0, MessageFlags::empty());
        assert_eq!(tag.label(), 0xFFFFF);
    }

    #[test]
    fn label_does_not_bleed_into_length() {
        let tag = MessageTag::new(0xFFFFF, 0, 0, MessageFlags::empty());
        assert_eq!(tag.length(), 0);
    }

    #[test]
    fn with_error_sets_only_error_field() {
        let tag = MessageTag::new(42, 1, 0, MessageFlags::empty());
        let replied = tag.with_error(7);
        assert_eq!(replied.error(), 7);
        assert_eq!(replied.label(), 42);
        assert_eq!(replied.length(), 1);
    }

    #[test]
    fn with_length_preserves_other_fields() {
        let tag = MessageTag::new(5, 0, 2, MessageFlags::DONATE);
        let updated = tag.with_length(4);
        assert_eq!(updated.length(), 4);
        assert_eq!(updated.label(), 5);
        assert_eq!(updated.cap_count(), 2);
        assert_eq!(updated.flags(), MessageFlags::DONATE);
    }

    #[test]
    fn bits_roundtrip() {
        let tag = MessageTag::new(100, 2, 0, MessageFlags::BLOCKING);
        assert_eq!(MessageTag::from_bits(tag.to_bits()), tag);
    }

    #[test]
    fn fast_message_carries_regs() {
        let tag = MessageTag::new(100, 2, 0, MessageFlags::empty());
        let msg = Message::fast(tag, [0xCAFE0000, 0xDEAD0000, 0, 0, 0, 0, 0, 0]);
        assert_eq!(msg.regs[0], 0xCAFE0000);
        assert_eq!(msg.regs[1], 0xDEAD0000);
        assert_eq!(msg.tag.label(), 100);
    }

    #[test]
    fn cap_transfers_respects_cap_count() {
        let tag = MessageTag::new(0, 0, 2, MessageFlags::empty());
        let mut msg = Message::fast(tag, [0; NUM_REGS]);
        msg.caps[0] = CapTransfer { slot: 3 };
        msg.caps[1] = CapTransfer { slot: 9 };
        msg.caps[2] = CapTransfer { slot: 255 };
        let caps = msg.cap_transfers();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps.as_slice()[0].slot, 3);
        assert_eq!(caps.as_slice()[1].slot, 9);
    }
}
