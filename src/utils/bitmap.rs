use std::sync::atomic::{AtomicUsize, Ordering};

use super::BITS_PER_WORD;

/// Fixed-size bitmap whose bits may be set and cleared concurrently.
///
/// Used both for region-indexed maps (active/inactive regions) and as the backing store of
/// the address-indexed mark bitmap.
pub struct AtomicBitMap {
    map: Box<[AtomicUsize]>,
    size: usize,
}

impl AtomicBitMap {
    pub const fn size_in_words(bits: usize) -> usize {
        (bits + BITS_PER_WORD - 1) / BITS_PER_WORD
    }

    pub fn new(size: usize) -> Self {
        let map = (0..Self::size_in_words(size))
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { map, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    const fn word_index(bit: usize) -> usize {
        bit / BITS_PER_WORD
    }

    const fn bit_mask(bit: usize) -> usize {
        1 << (bit % BITS_PER_WORD)
    }

    /// Mask of the bits `[from, to)` inside a single word, `to` may equal `BITS_PER_WORD`.
    const fn range_mask(from: usize, to: usize) -> usize {
        let upper = if to >= BITS_PER_WORD {
            !0
        } else {
            (1usize << to) - 1
        };
        let lower = (1usize << from) - 1;
        upper & !lower
    }

    fn verify_index(&self, index: usize) {
        assert!(
            index < self.size,
            "BitMap index is out of bounds: {} >= {}",
            index,
            self.size
        );
    }

    fn verify_range(&self, start: usize, end: usize) {
        assert!(start <= end, "BitMap range is invalid: {} > {}", start, end);
        assert!(
            end <= self.size,
            "BitMap limit is out of bounds: {} > {}",
            end,
            self.size
        );
    }

    #[inline]
    pub fn at(&self, index: usize) -> bool {
        self.verify_index(index);
        self.map[Self::word_index(index)].load(Ordering::Acquire) & Self::bit_mask(index) != 0
    }

    /// Sets the bit, returning `true` if this call changed it.
    #[inline]
    pub fn par_set_bit(&self, index: usize) -> bool {
        self.verify_index(index);
        let mask = Self::bit_mask(index);
        let word = &self.map[Self::word_index(index)];
        let mut old = word.load(Ordering::Relaxed);

        loop {
            let new = old | mask;
            if new == old {
                return false;
            }

            match word.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(val) => old = val,
            }
        }
    }

    /// Clears the bit, returning `true` if this call changed it.
    #[inline]
    pub fn par_clear_bit(&self, index: usize) -> bool {
        self.verify_index(index);
        let mask = Self::bit_mask(index);
        let old = self.map[Self::word_index(index)].fetch_and(!mask, Ordering::AcqRel);
        old & mask != 0
    }

    pub fn par_set_range(&self, start: usize, end: usize) {
        self.verify_range(start, end);
        self.apply_range(start, end, |word, mask| {
            word.fetch_or(mask, Ordering::AcqRel);
        });
    }

    pub fn par_clear_range(&self, start: usize, end: usize) {
        self.verify_range(start, end);
        self.apply_range(start, end, |word, mask| {
            word.fetch_and(!mask, Ordering::AcqRel);
        });
    }

    fn apply_range(&self, start: usize, end: usize, op: impl Fn(&AtomicUsize, usize)) {
        let mut index = start;
        while index < end {
            let word = Self::word_index(index);
            let from = index % BITS_PER_WORD;
            let to = (end - word * BITS_PER_WORD).min(BITS_PER_WORD);
            op(&self.map[word], Self::range_mask(from, to));
            index = (word + 1) * BITS_PER_WORD;
        }
    }

    pub fn count_one_bits_in_range(&self, start: usize, end: usize) -> usize {
        self.verify_range(start, end);
        let mut count = 0;
        let mut index = start;
        while index < end {
            let word = Self::word_index(index);
            let from = index % BITS_PER_WORD;
            let to = (end - word * BITS_PER_WORD).min(BITS_PER_WORD);
            let bits = self.map[word].load(Ordering::Acquire) & Self::range_mask(from, to);
            count += bits.count_ones() as usize;
            index = (word + 1) * BITS_PER_WORD;
        }
        count
    }

    pub fn count_ones(&self) -> usize {
        self.count_one_bits_in_range(0, self.size)
    }

    /// Returns the index of the first set bit in `[start, end)`, or `end` if there is none.
    pub fn find_first_set_bit(&self, start: usize, end: usize) -> usize {
        self.find_first(start, end, false)
    }

    /// Returns the index of the first clear bit in `[start, end)`, or `end` if there is none.
    pub fn find_first_clear_bit(&self, start: usize, end: usize) -> usize {
        self.find_first(start, end, true)
    }

    fn find_first(&self, start: usize, end: usize, flip: bool) -> usize {
        self.verify_range(start, end);
        let mut index = start;
        while index < end {
            let word = Self::word_index(index);
            let mut bits = self.map[word].load(Ordering::Acquire);
            if flip {
                bits = !bits;
            }
            bits >>= index % BITS_PER_WORD;

            if bits != 0 {
                return (index + bits.trailing_zeros() as usize).min(end);
            }
            index = (word + 1) * BITS_PER_WORD;
        }
        end
    }

    /// Calls `f` for every set bit in `[start, end)` in increasing order. Bits set behind
    /// the cursor while iterating are not visited. Stops early when `f` returns `false`,
    /// in which case `false` is returned.
    pub fn iterate(&self, start: usize, end: usize, mut f: impl FnMut(usize) -> bool) -> bool {
        let mut index = self.find_first_set_bit(start, end);
        while index < end {
            if !f(index) {
                return false;
            }
            index = self.find_first_set_bit(index + 1, end);
        }
        true
    }

    pub fn clear_all(&self) {
        for word in self.map.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }
}
