//! IPC-specific error codes.
//!
//! Distinct from [`ferrite_core::error::Errno`]: IPC failures carry meaning
//! that doesn't map cleanly onto the general syscall error space (a "no
//! partner" non-blocking failure isn't quite `Busy`, and a message delivered
//! to a dead endpoint isn't quite `NoSuchEntry`), so they get their own
//! 16-bit code, carried in the message tag's error field.

use core::fmt;

/// An IPC operation's result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IpcError {
    /// No error.
    Ok = 0,
    /// A supplied argument (endpoint id, capability slot, message shape)
    /// was invalid.
    Invalid = 1,
    /// The target endpoint has been destroyed.
    EndpointDead = 2,
    /// The operation timed out.
    Timeout = 3,
    /// The operation was canceled (endpoint destroyed while blocked).
    Canceled = 4,
    /// The extension buffer or capability list overflowed its fixed
    /// capacity.
    Overflow = 5,
    /// A non-blocking send/receive found no partner queued.
    NoPartner = 6,
    /// The capability space or endpoint is locked by a concurrent
    /// operation that cannot be waited on here.
    Busy = 7,
    /// The caller's capability lacks the rights the operation requires.
    Permission = 8,
}

impl IpcError {
    /// Encodes this error as the 16-bit field carried in a message tag.
    pub const fn to_tag_bits(self) -> u16 {
        self as u16
    }

    /// Decodes a message tag's error field back into an `IpcError`, if it
    /// names one of the known codes.
    pub const fn from_tag_bits(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(Self::Ok),
            1 => Some(Self::Invalid),
            2 => Some(Self::EndpointDead),
            3 => Some(Self::Timeout),
            4 => Some(Self::Canceled),
            5 => Some(Self::Overflow),
            6 => Some(Self::NoPartner),
            7 => Some(Self::Busy),
            8 => Some(Self::Permission),
            _ => None,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpcError::Ok => "success",
            IpcError::Invalid => "invalid IPC argument",
            IpcError::EndpointDead => "endpoint dead",
            IpcError::Timeout => "IPC timeout",
            IpcError::Canceled => "IPC canceled",
            IpcError::Overflow => "IPC payload overflow",
            IpcError::NoPartner => "no partner",
            IpcError::Busy => "IPC object busy",
            IpcError::Permission => "permission denied",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_bits_roundtrip() {
        for err in [
            IpcError::Ok,
            IpcError::Invalid,
            IpcError::EndpointDead,
            IpcError::Timeout,
            IpcError::Canceled,
            IpcError::Overflow,
            IpcError::NoPartner,
            IpcError::Busy,
            IpcError::Permission,
        ] {
            assert_eq!(IpcError::from_tag_bits(err.to_tag_bits()), Some(err));
        }
    }

    #[test]
    fn unknown_bits_decode_to_none() {
        assert_eq!(IpcError::from_tag_bits(0xFFFF), None);
    }
}
