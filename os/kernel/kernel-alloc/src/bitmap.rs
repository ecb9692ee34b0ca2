//! A fixed-size bitmap over storage the allocator does not own as a Rust value.
//!
//! A set bit means "in use". Scans skip whole 64-bit words that are full.

use core::ops::Range;

pub(crate) struct Bitmap {
    words: &'static mut [u64],
    bits: u64,
}

impl Bitmap {
    /// Words needed to hold `bits` bits.
    #[inline]
    pub const fn words_for(bits: u64) -> u64 {
        bits.div_ceil(64)
    }

    /// Take over `words` and set every bit to `used`.
    ///
    /// Bits past `bits` in the last word are always set so scans never
    /// report them as free.
    pub fn new(words: &'static mut [u64], bits: u64, used: bool) -> Self {
        debug_assert!(words.len() as u64 >= Self::words_for(bits));
        words.fill(if used { u64::MAX } else { 0 });
        let tail = bits % 64;
        if tail != 0 {
            if let Some(last) = words.get_mut((bits / 64) as usize) {
                *last |= u64::MAX << tail;
            }
        }
        Self { words, bits }
    }

    #[inline]
    pub const fn len(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn is_set(&self, i: u64) -> bool {
        debug_assert!(i < self.bits);
        self.words[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, i: u64) {
        debug_assert!(i < self.bits);
        self.words[(i / 64) as usize] |= 1 << (i % 64);
    }

    #[inline]
    pub fn clear(&mut self, i: u64) {
        debug_assert!(i < self.bits);
        self.words[(i / 64) as usize] &= !(1 << (i % 64));
    }

    /// Lowest clear bit inside `range`.
    pub fn find_clear(&self, range: Range<u64>) -> Option<u64> {
        let range = range.start..range.end.min(self.bits);
        let mut i = range.start;
        while i < range.end {
            let word = self.words[(i / 64) as usize];
            if i % 64 == 0 && word == u64::MAX {
                i += 64;
                continue;
            }
            if word & (1 << (i % 64)) == 0 {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Lowest start of `count` consecutive clear bits entirely inside `range`.
    pub fn find_clear_run(&self, range: Range<u64>, count: u64) -> Option<u64> {
        let end = range.end.min(self.bits);
        let mut start = range.start;
        while start.checked_add(count)? <= end {
            let first = self.find_clear(start..end)?;
            if first + count > end {
                return None;
            }
            match (first..first + count).find(|&j| self.is_set(j)) {
                None => return Some(first),
                Some(used) => start = used + 1,
            }
        }
        None
    }
}
