//! The kernel-wide error enumeration returned across the syscall ABI.
//!
//! Every subsystem (PMM, VMM, scheduler, IPC, syscall dispatch) eventually
//! funnels its failures through this type so that a syscall's numeric
//! return value has one consistent meaning regardless of which layer
//! rejected the request.

use core::fmt;

/// A kernel-wide error code, encoded as a small negative `isize` on the
/// syscall ABI (`-(code as isize)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// No error.
    Ok = 0,
    /// A supplied argument was out of range or malformed.
    InvalidArgument = 1,
    /// An allocator (PMM, slab, kmalloc) is exhausted.
    OutOfMemory = 2,
    /// The requested entry (PID, fd, capability slot, endpoint) does not exist.
    NoSuchEntry = 3,
    /// The resource is currently in use.
    Busy = 4,
    /// The operation is not permitted for the caller's credentials/rights.
    PermissionDenied = 5,
    /// An I/O operation failed.
    Io = 6,
    /// The syscall number or sub-operation is not implemented.
    NotImplemented = 7,
    /// A user pointer failed validation.
    BadAddress = 8,
    /// The entry being created already exists.
    AlreadyExists = 9,
    /// No such device.
    NoSuchDevice = 10,
}

impl Errno {
    /// Encodes this error as the negative `isize` a syscall handler returns.
    pub const fn to_retval(self) -> isize {
        -(self as isize)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::Ok => "success",
            Errno::InvalidArgument => "invalid argument",
            Errno::OutOfMemory => "out of memory",
            Errno::NoSuchEntry => "no such entry",
            Errno::Busy => "busy",
            Errno::PermissionDenied => "permission denied",
            Errno::Io => "I/O error",
            Errno::NotImplemented => "not implemented",
            Errno::BadAddress => "bad address",
            Errno::AlreadyExists => "already exists",
            Errno::NoSuchDevice => "no such device",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retval_is_negative() {
        assert_eq!(Errno::InvalidArgument.to_retval(), -1);
        assert_eq!(Errno::Ok.to_retval(), 0);
    }
}
