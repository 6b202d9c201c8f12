//! PID allocation: a fixed-size bitmap with a rotating cursor.
//!
//! Host-testable, like `ferrite-mm::buddy`'s data structure beneath its
//! global-singleton wrapper. PID 0 is reserved for the idle/kernel role
//! and is never handed out by [`PidBitmap::alloc`].

use ferrite_core::id::Pid;
use ferrite_core::sync::SpinLock;

/// Total PID space. Bit `n` set means PID `n` is in use.
pub const MAX_PIDS: usize = 32768;

const WORDS: usize = MAX_PIDS / 64;

/// A fixed 32768-bit allocation bitmap with a rotating search cursor.
pub struct PidBitmap {
    bits: [u64; WORDS],
    cursor: usize,
    free_count: usize,
}

impl PidBitmap {
    /// Creates a bitmap with every PID free except PID 0, which is marked
    /// permanently reserved.
    pub const fn new() -> Self {
        let mut bits = [0u64; WORDS];
        bits[0] = 1; // PID 0 reserved
        Self {
            bits,
            cursor: 1,
            free_count: MAX_PIDS - 1,
        }
    }

    /// Returns the lowest free PID at or after the cursor, wrapping around
    /// once. Returns `None` if the bitmap is full.
    pub fn alloc(&mut self) -> Option<Pid> {
        if self.free_count == 0 {
            return None;
        }
        for offset in 0..MAX_PIDS {
            let idx = (self.cursor + offset) % MAX_PIDS;
            let word = idx / 64;
            let bit = idx % 64;
            if self.bits[word] & (1 << bit) == 0 {
                self.bits[word] |= 1 << bit;
                self.free_count -= 1;
                self.cursor = (idx + 1) % MAX_PIDS;
                return Some(Pid::new(idx as u32));
            }
        }
        None
    }

    /// Returns `pid` to the free pool.
    ///
    /// # Panics
    ///
    /// Panics if `pid` is 0 (reserved) or out of range.
    pub fn free(&mut self, pid: Pid) {
        let idx = pid.as_u32() as usize;
        assert!(idx != 0 && idx < MAX_PIDS, "PID: invalid free of {idx}");
        let word = idx / 64;
        let bit = idx % 64;
        assert!(self.bits[word] & (1 << bit) != 0, "PID: double free of {idx}");
        self.bits[word] &= !(1 << bit);
        self.free_count += 1;
    }

    /// Number of PIDs currently in use (including the reserved PID 0).
    pub fn used(&self) -> usize {
        MAX_PIDS - self.free_count
    }
}

impl Default for PidBitmap {
    fn default() -> Self {
        Self::new()
    }
}

static PIDS: SpinLock<PidBitmap> = SpinLock::new(PidBitmap::new());

/// Allocates a PID from the global bitmap.
pub fn alloc() -> Option<Pid> {
    PIDS.lock().alloc()
}

/// Frees `pid` back to the global bitmap.
pub fn free(pid: Pid) {
    PIDS.lock().free(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_zero_is_reserved() {
        let mut bm = PidBitmap::new();
        assert_eq!(bm.used(), 1);
        let first = bm.alloc().unwrap();
        assert_ne!(first.as_u32(), 0);
    }

    #[test]
    fn alloc_returns_lowest_free_pid() {
        let mut bm = PidBitmap::new();
        let a = bm.alloc().unwrap();
        let b = bm.alloc().unwrap();
        assert_eq!(a.as_u32(), 1);
        assert_eq!(b.as_u32(), 2);
    }

    #[test]
    fn freed_pid_is_reused() {
        let mut bm = PidBitmap::new();
        let a = bm.alloc().unwrap();
        bm.free(a);
        let b = bm.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cursor_rotates_past_reused_slots() {
        let mut bm = PidBitmap::new();
        let a = bm.alloc().unwrap();
        let _b = bm.alloc().unwrap();
        bm.free(a);
        let c = bm.alloc().unwrap();
        // cursor has moved past `a`'s slot, so the next fresh alloc skips it
        assert_ne!(c.as_u32(), a.as_u32());
    }

    #[test]
    fn exhausting_the_bitmap_returns_none_without_looping_forever() {
        let mut bm = PidBitmap::new();
        let mut allocated = Vec::new();
        while let Some(p) = bm.alloc() {
            allocated.push(p);
        }
        assert_eq!(allocated.len(), MAX_PIDS - 1);
        assert!(bm.alloc().is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn freeing_an_already_free_pid_panics() {
        let mut bm = PidBitmap::new();
        let a = bm.alloc().unwrap();
        bm.free(a);
        bm.free(a);
    }
}
