//! Thread ID allocation.
//!
//! `ferrite_sched::thread::ThreadTable` indexes its backing array directly
//! by `tid.as_u32()`, so unlike [`crate::pid`]'s deliberately oversized bitmap,
//! this one is sized to exactly `MAX_THREADS` slots and TID 0 is reserved
//! for the idle thread.

use ferrite_core::id::Tid;
use ferrite_core::sync::SpinLock;
use ferrite_sched::thread::MAX_THREADS;

const WORDS: usize = MAX_THREADS / 64;

/// A fixed `MAX_THREADS`-bit allocation bitmap with a rotating search cursor.
pub struct TidBitmap {
    bits: [u64; WORDS],
    cursor: usize,
    free_count: usize,
}

impl TidBitmap {
    /// Creates a bitmap with every TID free except TID 0, reserved for the
    /// idle thread.
    pub const fn new() -> Self {
        let mut bits = [0u64; WORDS];
        bits[0] = 1;
        Self {
            bits,
            cursor: 1,
            free_count: MAX_THREADS - 1,
        }
    }

    /// Returns the lowest free TID at or after the cursor, wrapping around
    /// once. Returns `None` if the bitmap is full.
    pub fn alloc(&mut self) -> Option<Tid> {
        if self.free_count == 0 {
            return None;
        }
        for offset in 0..MAX_THREADS {
            let idx = (self.cursor + offset) % MAX_THREADS;
            let word = idx / 64;
            let bit = idx % 64;
            if self.bits[word] & (1 << bit) == 0 {
                self.bits[word] |= 1 << bit;
                self.free_count -= 1;
                self.cursor = (idx + 1) % MAX_THREADS;
                return Some(Tid::new(idx as u32));
            }
        }
        None
    }

    /// Returns `tid` to the free pool.
    pub fn free(&mut self, tid: Tid) {
        let idx = tid.as_u32() as usize;
        assert!(idx != 0 && idx < MAX_THREADS, "TID: invalid free of {idx}");
        let word = idx / 64;
        let bit = idx % 64;
        assert!(self.bits[word] & (1 << bit) != 0, "TID: double free of {idx}");
        self.bits[word] &= !(1 << bit);
        self.free_count += 1;
    }
}

impl Default for TidBitmap {
    fn default() -> Self {
        Self::new()
    }
}

static TIDS: SpinLock<TidBitmap> = SpinLock::new(TidBitmap::new());

/// Allocates a TID from the global bitmap.
pub fn alloc() -> Option<Tid> {
    TIDS.lock().alloc()
}

/// Frees `tid` back to the global bitmap.
pub fn free(tid: Tid) {
    TIDS.lock().free(tid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_zero_is_reserved() {
        let mut bm = TidBitmap::new();
        let first = bm.alloc().unwrap();
        assert_ne!(first.as_u32(), 0);
    }

    #[test]
    fn freed_tid_is_reused() {
        let mut bm = TidBitmap::new();
        let a = bm.alloc().unwrap();
        bm.free(a);
        let b = bm.alloc().unwrap();
        assert_eq!(a, b);
    }
}
