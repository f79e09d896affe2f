use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;

use super::{bytes_to_words, words_to_bytes, MemRegion};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegionKind {
    /// On the free list, nothing allocated.
    Free,
    /// Installed in an alloc region, bump allocation in progress.
    Alloc,
    /// Retired from allocation.
    Old,
}

/// Descriptor of a fixed-size heap region.
///
/// Descriptors are created once when the heap is set up and stay valid while the region's
/// backing memory is committed and uncommitted. They live in a side table, never inside
/// the region itself.
///
/// # Marking metadata
///
/// `tams` (top at mark start) is snapshotted from `top` when a marking cycle starts. Objects
/// in `[bottom, tams)` are subject to marking, objects in `[tams, top)` were allocated during
/// the cycle and are implicitly live.
pub struct HeapRegion {
    index: usize,
    bottom: usize,
    end: usize,
    top: AtomicUsize,
    tams: AtomicUsize,
    kind: Atomic<RegionKind>,
    live_words: AtomicUsize,
}

impl HeapRegion {
    pub fn new(index: usize, bottom: usize, size_bytes: usize) -> Self {
        Self {
            index,
            bottom,
            end: bottom + size_bytes,
            top: AtomicUsize::new(bottom),
            tams: AtomicUsize::new(bottom),
            kind: Atomic::new(RegionKind::Free),
            live_words: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bottom(&self) -> usize {
        self.bottom
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn set_top(&self, top: usize) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    pub fn tams(&self) -> usize {
        self.tams.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.end - self.bottom
    }

    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    pub fn mem_region(&self) -> MemRegion {
        MemRegion::new(self.bottom, self.end)
    }

    pub fn kind(&self) -> RegionKind {
        self.kind.load(Ordering::Acquire)
    }

    pub fn set_kind(&self, kind: RegionKind) {
        self.kind.store(kind, Ordering::Release);
    }

    /// Bump-allocates between `min_words` and `desired_words` words.
    ///
    /// Gives up after `max_retries` lost races. A caller whose CAS failed has not modified
    /// the region.
    pub fn par_allocate(
        &self,
        min_words: usize,
        desired_words: usize,
        max_retries: usize,
    ) -> Option<(usize, usize)> {
        debug_assert!(min_words <= desired_words);
        let mut top = self.top.load(Ordering::Acquire);
        let mut retries = 0;

        loop {
            let available = bytes_to_words(self.end - top);
            let actual = desired_words.min(available);
            if actual < min_words || actual == 0 {
                return None;
            }

            let new_top = top + words_to_bytes(actual);
            match self
                .top
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((top, actual)),
                Err(current) => {
                    retries += 1;
                    if retries >= max_retries {
                        return None;
                    }
                    top = current;
                }
            }
        }
    }

    pub fn note_start_of_marking(&self) {
        self.tams.store(self.top(), Ordering::Release);
    }

    /// Objects below TAMS take part in marking.
    pub fn is_below_tams(&self, addr: usize) -> bool {
        addr < self.tams()
    }

    /// Live words found by the last completed marking.
    pub fn live_words(&self) -> usize {
        self.live_words.load(Ordering::Acquire)
    }

    pub fn set_live_words(&self, words: usize) {
        self.live_words.store(words, Ordering::Release);
    }

    /// Returns the region to the pristine state of a freshly committed one.
    pub fn reset(&self) {
        self.top.store(self.bottom, Ordering::Release);
        self.tams.store(self.bottom, Ordering::Release);
        self.live_words.store(0, Ordering::Release);
        self.set_kind(RegionKind::Free);
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("index", &self.index)
            .field("bottom", &format_args!("{:#x}", self.bottom))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("tams", &format_args!("{:#x}", self.tams()))
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HEAP_WORD_SIZE;

    #[test]
    fn test_par_allocate_bounds() {
        let region = HeapRegion::new(0, 0x10000, 64 * HEAP_WORD_SIZE);
        assert_eq!(region.par_allocate(8, 16, 4), Some((0x10000, 16)));
        assert_eq!(region.used(), 16 * HEAP_WORD_SIZE);

        // Only 48 words remain, the request is trimmed to what fits.
        assert_eq!(
            region.par_allocate(8, 100, 4),
            Some((0x10000 + 16 * HEAP_WORD_SIZE, 48))
        );
        assert_eq!(region.free(), 0);
        assert_eq!(region.par_allocate(1, 1, 4), None);
    }

    #[test]
    fn test_tams() {
        let region = HeapRegion::new(3, 0x30000, 64 * HEAP_WORD_SIZE);
        region.par_allocate(4, 4, 1).unwrap();
        region.note_start_of_marking();
        assert!(region.is_below_tams(0x30000));
        region.par_allocate(4, 4, 1).unwrap();
        assert!(!region.is_below_tams(0x30000 + 4 * HEAP_WORD_SIZE));

        region.reset();
        assert!(region.is_empty());
        assert_eq!(region.tams(), region.bottom());
        assert_eq!(region.kind(), RegionKind::Free);
    }
}
