use super::{options::HeapOptions, region::HeapRegion, MemRegion};

/// Dense mapping between region indices and the address range they cover.
///
/// The table is built once for the whole reserved heap and is read-only afterwards;
/// per-region mutable state lives in the atomics of [`HeapRegion`].
pub struct RegionTable {
    regions: Box<[HeapRegion]>,
    reserved: MemRegion,
    shift: usize,
}

impl RegionTable {
    pub fn new(heap_start: usize, opts: &HeapOptions) -> Self {
        assert!(
            super::is_aligned(heap_start, opts.region_size_bytes),
            "heap start {:#x} is not region aligned",
            heap_start
        );

        let regions = (0..opts.region_count)
            .map(|i| HeapRegion::new(i, heap_start + (i << opts.region_size_bytes_shift), opts.region_size_bytes))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            regions,
            reserved: MemRegion::new(heap_start, heap_start + opts.max_heap_size),
            shift: opts.region_size_bytes_shift,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn reserved(&self) -> MemRegion {
        self.reserved
    }

    pub fn region_size(&self) -> usize {
        1 << self.shift
    }

    pub fn is_in_reserved(&self, addr: usize) -> bool {
        self.reserved.contains(addr)
    }

    #[inline]
    pub fn at(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    #[inline]
    pub fn addr_to_index(&self, addr: usize) -> usize {
        debug_assert!(
            self.is_in_reserved(addr),
            "address {:#x} is outside of the heap {}",
            addr,
            self.reserved
        );
        (addr - self.reserved.start()) >> self.shift
    }

    #[inline]
    pub fn region_containing(&self, addr: usize) -> &HeapRegion {
        self.at(self.addr_to_index(addr))
    }

    pub fn bottom_of(&self, index: usize) -> usize {
        self.reserved.start() + (index << self.shift)
    }

    /// Address range covered by regions `[start, end)`.
    pub fn range_of(&self, start: usize, end: usize) -> MemRegion {
        MemRegion::new(self.bottom_of(start), self.bottom_of(end))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions.iter()
    }
}
