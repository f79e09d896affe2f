use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::{
    alloc_region::AllocRegionBackend,
    object_model::ObjectModel,
    options::HeapOptions,
    region::{HeapRegion, RegionKind},
    region_manager::HeapRegionManager,
    region_table::RegionTable,
    virtual_memory::{CommitMapper, MemoryError, ReservedSpace},
    words_to_bytes,
};
use crate::utils::formatted_size;

/// Shared heap context: region geometry, region lifecycle and the object model.
///
/// Passed by reference to allocators and to the marking engine; there is no global heap
/// instance, so independent heaps can coexist (tests create many).
pub struct Heap {
    options: HeapOptions,
    regions: HeapRegionManager,
    model: Arc<dyn ObjectModel>,
    alloc_region_limit: AtomicUsize,
    alloc_regions_used: AtomicUsize,
    retired_bytes: AtomicUsize,
}

impl Heap {
    /// Reserves address space for `options.max_heap_size` bytes and commits `initial_regions`.
    pub fn reserve(
        options: HeapOptions,
        initial_regions: usize,
        model: Arc<dyn ObjectModel>,
    ) -> Result<Self, MemoryError> {
        let space = Arc::new(ReservedSpace::reserve(
            options.max_heap_size,
            options.region_size_bytes,
        )?);
        let heap = Self::with_mapper(options, space.start(), space, model);
        heap.regions.expand_by(initial_regions);
        Ok(heap)
    }

    /// Builds a heap over `[heap_start, heap_start + max_heap_size)` that commits memory
    /// through `mapper`. No regions are committed yet.
    pub fn with_mapper(
        options: HeapOptions,
        heap_start: usize,
        mapper: Arc<dyn CommitMapper>,
        model: Arc<dyn ObjectModel>,
    ) -> Self {
        let table = RegionTable::new(heap_start, &options);
        log::info!(target: "gc", "Heap at {}: {}", table.reserved(), options);
        Self {
            options,
            regions: HeapRegionManager::new(table, mapper),
            model,
            alloc_region_limit: AtomicUsize::new(usize::MAX),
            alloc_regions_used: AtomicUsize::new(0),
            retired_bytes: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn regions(&self) -> &HeapRegionManager {
        &self.regions
    }

    pub fn table(&self) -> &RegionTable {
        self.regions.table()
    }

    pub fn model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    pub fn region_size_words(&self) -> usize {
        self.options.region_size_words
    }

    /// Whether `addr` lies in the allocated part of an active region.
    pub fn is_in(&self, addr: usize) -> bool {
        let table = self.table();
        if !table.is_in_reserved(addr) {
            return false;
        }
        let region = table.region_containing(addr);
        self.regions.is_available(region.index()) && addr < region.top()
    }

    /// Caps how many regions non-forced allocation may take until the next
    /// [`Heap::reset_alloc_region_count`].
    pub fn set_alloc_region_limit(&self, limit: usize) {
        self.alloc_region_limit.store(limit, Ordering::Relaxed);
    }

    pub fn reset_alloc_region_count(&self) {
        self.alloc_regions_used.store(0, Ordering::Relaxed);
    }

    pub fn retired_bytes(&self) -> usize {
        self.retired_bytes.load(Ordering::Relaxed)
    }

    pub fn used_bytes(&self) -> usize {
        self.regions.in_use_regions().map(|r| r.used()).sum()
    }

    pub fn print_on(&self) {
        log::info!(
            target: "gc",
            "Heap: {} reserved, {} committed, {} used, {} active regions ({} free, {} inactive)",
            formatted_size(self.options.max_heap_size),
            formatted_size(self.regions.num_committed_regions() * self.options.region_size_bytes),
            formatted_size(self.used_bytes()),
            self.regions.num_active_regions(),
            self.regions.num_free_regions(),
            self.regions.num_inactive_regions()
        );
    }
}

impl AllocRegionBackend for Heap {
    fn allocate_new_region(&self, min_words: usize, force: bool) -> Option<&HeapRegion> {
        if min_words > self.options.region_size_words {
            return None;
        }

        if !force
            && self.alloc_regions_used.load(Ordering::Relaxed)
                >= self.alloc_region_limit.load(Ordering::Relaxed)
        {
            return None;
        }

        let region = match self.regions.allocate_free_region() {
            Some(region) => region,
            None => {
                if self.regions.expand_by(1) == 0 {
                    return None;
                }
                self.regions.allocate_free_region()?
            }
        };

        region.set_kind(RegionKind::Alloc);
        self.alloc_regions_used.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "gc-alloc", "New alloc region {} (force: {})", region.index(), force);
        Some(region)
    }

    fn retire_region(&self, region: &HeapRegion, bytes_used: usize) {
        region.set_kind(RegionKind::Old);
        self.retired_bytes.fetch_add(bytes_used, Ordering::Relaxed);
        log::trace!(target: "gc-alloc", "Retired region {} with {} allocated", region.index(), formatted_size(bytes_used));
    }

    fn region_at(&self, index: usize) -> &HeapRegion {
        self.table().at(index)
    }

    fn fill_with_dummy_object(&self, start: usize, words: usize) {
        debug_assert!(self.table().region_containing(start).end() >= start + words_to_bytes(words));
        self.model.fill_with_dummy_object(start, words);
    }

    fn min_filler_words(&self) -> usize {
        self.model.min_filler_words()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{
        alloc_region::AllocRegion,
        testing::{init_logging, TestModel},
    };

    #[test]
    fn test_reserved_heap_commits_real_memory() {
        init_logging();
        let region_size = 64 * 1024;
        let options = HeapOptions::setup_sizes(8 * region_size, Some(region_size));
        let heap = Arc::new(Heap::reserve(options, 2, Arc::new(TestModel::new())).unwrap());
        assert_eq!(heap.regions().num_active_regions(), 2);
        assert_eq!(heap.regions().num_free_regions(), 2);

        assert_eq!(heap.regions().expand_by(3), 3);
        assert_eq!(heap.regions().num_committed_regions(), 5);
        for region in heap.regions().active_regions() {
            unsafe {
                let p = region.bottom() as *mut usize;
                p.write(region.index());
                assert_eq!(p.read(), region.index());
            }
        }

        let alloc = AllocRegion::new("test", heap.clone(), 16);
        let (addr, words) = alloc.allocate(8, 8).unwrap();
        assert_eq!(words, 8);
        assert!(heap.is_in(addr));
        unsafe {
            let p = (addr + words_to_bytes(7)) as *mut usize;
            p.write(0xfeed);
            assert_eq!(p.read(), 0xfeed);
        }
        alloc.release();

        // Free regions go back to the OS through the inactive state.
        assert_eq!(heap.regions().shrink_by(2), 2);
        assert_eq!(heap.regions().uncommit_inactive_regions(usize::MAX), 2);
        assert_eq!(heap.regions().num_committed_regions(), 3);
        assert_eq!(heap.regions().expand_by(1), 1);
        heap.regions().committed_map().verify();
    }
}
