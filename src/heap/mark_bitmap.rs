use crate::utils::bitmap::AtomicBitMap;

use super::{MemRegion, LOG_HEAP_WORD_SIZE};

/// One mark bit per heap word of the covered range.
///
/// Two instances exist per engine: the bitmap filled by the running cycle ("next") and the
/// one holding the last completed marking ("prev"). They are swapped when a cycle completes.
pub struct MarkBitmap {
    bits: AtomicBitMap,
    covered: MemRegion,
}

impl MarkBitmap {
    pub fn new(covered: MemRegion) -> Self {
        Self {
            bits: AtomicBitMap::new(covered.word_size()),
            covered,
        }
    }

    pub fn covered(&self) -> MemRegion {
        self.covered
    }

    #[inline]
    pub fn address_to_index(&self, addr: usize) -> usize {
        debug_assert!(
            self.covered.contains(addr),
            "address {:#x} not covered by mark bitmap {}",
            addr,
            self.covered
        );
        (addr - self.covered.start()) >> LOG_HEAP_WORD_SIZE
    }

    #[inline]
    pub fn index_to_address(&self, index: usize) -> usize {
        self.covered.start() + (index << LOG_HEAP_WORD_SIZE)
    }

    /// Marks `addr`. Returns `true` if this call marked it, `false` if it was already marked.
    #[inline]
    pub fn par_mark(&self, addr: usize) -> bool {
        self.bits.par_set_bit(self.address_to_index(addr))
    }

    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.bits.at(self.address_to_index(addr))
    }

    pub fn clear(&self, addr: usize) {
        self.bits.par_clear_bit(self.address_to_index(addr));
    }

    fn index_range(&self, mr: MemRegion) -> (usize, usize) {
        let mr = mr.intersection(&self.covered);
        if mr.is_empty() {
            return (0, 0);
        }
        (
            self.address_to_index(mr.start()),
            (mr.end() - self.covered.start()) >> LOG_HEAP_WORD_SIZE,
        )
    }

    pub fn clear_range(&self, mr: MemRegion) {
        let (start, end) = self.index_range(mr);
        if start < end {
            self.bits.par_clear_range(start, end);
        }
    }

    pub fn clear_all(&self) {
        self.bits.clear_all();
    }

    /// First marked address in `[addr, limit)`, or `limit`.
    pub fn next_marked_addr(&self, addr: usize, limit: usize) -> usize {
        let (start, end) = self.index_range(MemRegion::new(addr, limit));
        if start >= end {
            return limit;
        }
        let index = self.bits.find_first_set_bit(start, end);
        if index == end {
            limit
        } else {
            self.index_to_address(index)
        }
    }

    /// Visits marked addresses in `mr` in increasing order until `visitor` returns `false`.
    pub fn iterate(&self, mr: MemRegion, mut visitor: impl FnMut(usize) -> bool) -> bool {
        let (start, end) = self.index_range(mr);
        if start >= end {
            return true;
        }
        self.bits
            .iterate(start, end, |index| visitor(self.index_to_address(index)))
    }

    pub fn count_marked(&self, mr: MemRegion) -> usize {
        let (start, end) = self.index_range(mr);
        if start >= end {
            return 0;
        }
        self.bits.count_one_bits_in_range(start, end)
    }

    pub fn is_clear(&self) -> bool {
        self.bits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HEAP_WORD_SIZE;

    #[test]
    fn test_mark_and_iterate() {
        let covered = MemRegion::new(0x40000, 0x40000 + 1024 * HEAP_WORD_SIZE);
        let bitmap = MarkBitmap::new(covered);
        let a = 0x40000 + 10 * HEAP_WORD_SIZE;
        let b = 0x40000 + 700 * HEAP_WORD_SIZE;

        assert!(bitmap.par_mark(a));
        assert!(!bitmap.par_mark(a));
        assert!(bitmap.par_mark(b));
        assert!(bitmap.is_marked(a));
        assert!(!bitmap.is_marked(a + HEAP_WORD_SIZE));

        let mut seen = vec![];
        bitmap.iterate(covered, |addr| {
            seen.push(addr);
            true
        });
        assert_eq!(seen, vec![a, b]);

        assert_eq!(bitmap.next_marked_addr(a + HEAP_WORD_SIZE, covered.end()), b);
        assert_eq!(bitmap.next_marked_addr(b + HEAP_WORD_SIZE, covered.end()), covered.end());
        assert_eq!(bitmap.count_marked(MemRegion::new(0x40000, b)), 1);

        bitmap.clear_range(MemRegion::new(0x40000, b));
        assert!(!bitmap.is_marked(a));
        assert!(bitmap.is_marked(b));
        bitmap.clear_all();
        assert!(bitmap.is_clear());
    }
}
