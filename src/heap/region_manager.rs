use std::{collections::BTreeSet, ops::Range, sync::Arc};

use parking_lot::Mutex;

use super::{
    committed_region_map::{ActiveMapGuard, CommittedRegionMap, InactiveMapGuard},
    region::{HeapRegion, RegionKind},
    region_table::RegionTable,
    virtual_memory::CommitMapper,
};
use crate::utils::formatted_size;

/// Owns the region descriptors and moves regions through their lifecycle.
///
/// Free active regions are kept in an index-ordered set so allocation prefers low
/// addresses and shrinking gives back high ones.
pub struct HeapRegionManager {
    table: RegionTable,
    committed: CommittedRegionMap,
    mapper: Arc<dyn CommitMapper>,
    free_list: Mutex<BTreeSet<usize>>,
}

impl HeapRegionManager {
    pub fn new(table: RegionTable, mapper: Arc<dyn CommitMapper>) -> Self {
        let committed = CommittedRegionMap::new(table.len());
        Self {
            table,
            committed,
            mapper,
            free_list: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn committed_map(&self) -> &CommittedRegionMap {
        &self.committed
    }

    pub fn max_length(&self) -> usize {
        self.table.len()
    }

    pub fn num_free_regions(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn num_active_regions(&self) -> usize {
        self.committed.num_active()
    }

    pub fn num_inactive_regions(&self) -> usize {
        self.committed.num_inactive()
    }

    pub fn num_committed_regions(&self) -> usize {
        self.committed.num_active() + self.committed.num_inactive()
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.committed.active(index)
    }

    /// Makes up to `num_regions` more regions available, reusing inactive regions before
    /// committing new memory. Returns the number of regions added.
    pub fn expand_by(&self, num_regions: usize) -> usize {
        self.expand_at(0, num_regions)
    }

    /// Like [`HeapRegionManager::expand_by`] but only considers regions at or after `start`.
    pub fn expand_at(&self, start: usize, num_regions: usize) -> usize {
        if num_regions == 0 {
            return 0;
        }

        let active = self.committed.lock_active();
        let mut expanded = self.expand_inactive(&active, start, num_regions);

        let mut offset = start;
        while expanded < num_regions {
            let range = self.committed.next_committable_range(offset);
            if range.is_empty() {
                break;
            }

            let to_commit = (range.end - range.start).min(num_regions - expanded);
            let range = range.start..range.start + to_commit;
            if let Err(err) = self.mapper.commit(self.table.range_of(range.start, range.end)) {
                log::warn!(target: "gc-region", "Failed to expand heap: {}", err);
                break;
            }

            self.committed.activate(&active, range.start, range.end);
            self.add_to_free_list(range.clone());
            expanded += to_commit;
            offset = range.end;
        }

        if expanded > 0 {
            log::debug!(
                target: "gc-region",
                "Expanded heap by {} regions ({}), {} active",
                expanded,
                formatted_size(expanded * self.table.region_size()),
                self.committed.num_active()
            );
        }
        expanded
    }

    fn expand_inactive(&self, active: &ActiveMapGuard<'_>, start: usize, num_regions: usize) -> usize {
        let inactive = self.committed.lock_inactive();
        let mut expanded = 0;
        let mut offset = start;

        while expanded < num_regions {
            let range = self.committed.next_inactive_range(offset);
            if range.is_empty() {
                break;
            }

            let count = (range.end - range.start).min(num_regions - expanded);
            let range = range.start..range.start + count;
            self.committed.reactivate(active, &inactive, range.start, range.end);
            self.add_to_free_list(range.clone());
            expanded += count;
            offset = range.end;
        }
        expanded
    }

    fn add_to_free_list(&self, range: Range<usize>) {
        let mut free_list = self.free_list.lock();
        for index in range {
            self.table.at(index).reset();
            free_list.insert(index);
        }
    }

    /// Takes the lowest free region off the free list.
    pub fn allocate_free_region(&self) -> Option<&HeapRegion> {
        let index = {
            let mut free_list = self.free_list.lock();
            free_list.pop_first()?
        };

        let region = self.table.at(index);
        debug_assert!(self.is_available(index), "free region {} is not active", index);
        debug_assert!(region.is_empty(), "free region {} is not empty", index);
        Some(region)
    }

    /// Takes the free region at `index`, if it is on the free list.
    pub fn allocate_free_region_at(&self, index: usize) -> Option<&HeapRegion> {
        if !self.free_list.lock().remove(&index) {
            return None;
        }
        Some(self.table.at(index))
    }

    /// Resets `region` and returns it to the free list.
    pub fn free_region(&self, region: &HeapRegion) {
        debug_assert!(
            self.is_available(region.index()),
            "freeing region {} which is not active",
            region.index()
        );
        region.reset();
        let inserted = self.free_list.lock().insert(region.index());
        assert!(inserted, "region {} freed twice", region.index());
    }

    /// Deactivates up to `num_regions` free regions, highest indices first. Their memory
    /// stays committed until [`HeapRegionManager::uncommit_inactive_regions`] runs.
    pub fn shrink_by(&self, num_regions: usize) -> usize {
        let active = self.committed.lock_active();
        let inactive = self.committed.lock_inactive();
        let victims = {
            let mut free_list = self.free_list.lock();
            let victims = free_list
                .iter()
                .rev()
                .take(num_regions)
                .copied()
                .collect::<Vec<_>>();
            for index in &victims {
                free_list.remove(index);
            }
            victims
        };

        // Victims are in descending order; deactivate them as contiguous runs.
        let mut i = 0;
        while i < victims.len() {
            let end = victims[i] + 1;
            let mut start = victims[i];
            i += 1;
            while i < victims.len() && victims[i] + 1 == start {
                start = victims[i];
                i += 1;
            }
            self.deactivate(&active, &inactive, start..end);
        }

        if !victims.is_empty() {
            log::debug!(target: "gc-region", "Shrank heap by {} regions", victims.len());
        }
        victims.len()
    }

    fn deactivate(&self, active: &ActiveMapGuard<'_>, inactive: &InactiveMapGuard<'_>, range: Range<usize>) {
        self.committed.deactivate(active, inactive, range.start, range.end);
    }

    /// Releases the memory of up to `limit` inactive regions. Returns how many were uncommitted.
    pub fn uncommit_inactive_regions(&self, limit: usize) -> usize {
        let inactive = self.committed.lock_inactive();
        let mut uncommitted = 0;
        let mut offset = 0;

        while uncommitted < limit {
            let range = self.committed.next_inactive_range(offset);
            if range.is_empty() {
                break;
            }

            let count = (range.end - range.start).min(limit - uncommitted);
            let end = range.start + count;
            if let Err(err) = self.mapper.uncommit(self.table.range_of(range.start, end)) {
                log::warn!(target: "gc-region", "Failed to uncommit regions [{}, {}): {}", range.start, end, err);
                break;
            }
            self.committed.uncommit(&inactive, range.start, end);
            uncommitted += count;
            offset = end;
        }

        if uncommitted > 0 {
            log::debug!(target: "gc-region", "Uncommitted {} regions ({})", uncommitted, formatted_size(uncommitted * self.table.region_size()));
        }
        uncommitted
    }

    /// Regions that are currently active, in index order.
    pub fn active_regions(&self) -> impl Iterator<Item = &HeapRegion> + '_ {
        self.table
            .iter()
            .filter(move |region| self.committed.active(region.index()))
    }

    /// Active regions that hold objects (not on the free list).
    pub fn in_use_regions(&self) -> impl Iterator<Item = &HeapRegion> + '_ {
        self.active_regions()
            .filter(|region| region.kind() != RegionKind::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{
        options::HeapOptions,
        virtual_memory::{MemoryOp, NoopMapper},
    };

    fn new_manager(regions: usize) -> (HeapRegionManager, Arc<NoopMapper>) {
        let opts = HeapOptions::setup_sizes(regions * 4096, Some(4096));
        let mapper = Arc::new(NoopMapper::new());
        let manager = HeapRegionManager::new(RegionTable::new(0x100000, &opts), mapper.clone());
        (manager, mapper)
    }

    #[test]
    fn test_expand_allocate_free() {
        let (manager, mapper) = new_manager(8);
        assert_eq!(manager.expand_by(3), 3);
        assert_eq!(manager.num_active_regions(), 3);
        assert_eq!(manager.num_free_regions(), 3);
        assert_eq!(
            mapper.operations(),
            vec![(MemoryOp::Commit, manager.table().range_of(0, 3))]
        );

        let region = manager.allocate_free_region().unwrap();
        assert_eq!(region.index(), 0);
        region.set_kind(RegionKind::Old);
        region.par_allocate(4, 4, 1).unwrap();
        assert_eq!(manager.in_use_regions().count(), 1);

        manager.free_region(region);
        assert!(region.is_empty());
        assert_eq!(manager.num_free_regions(), 3);

        assert_eq!(manager.expand_by(100), 5);
        assert_eq!(manager.expand_by(1), 0);
    }

    #[test]
    fn test_shrink_reactivate_uncommit() {
        let (manager, mapper) = new_manager(8);
        manager.expand_by(8);
        let first = manager.allocate_free_region().unwrap();
        assert_eq!(first.index(), 0);

        assert_eq!(manager.shrink_by(3), 3);
        assert_eq!(manager.committed_map().next_inactive_range(0), 5..8);
        assert_eq!(manager.num_inactive_regions(), 3);
        assert_eq!(manager.num_committed_regions(), 8);

        // Reactivation reuses inactive regions without touching the mapper.
        let commits_before = mapper.operations().len();
        assert_eq!(manager.expand_by(1), 1);
        assert_eq!(mapper.operations().len(), commits_before);
        assert!(manager.is_available(5));

        assert_eq!(manager.uncommit_inactive_regions(usize::MAX), 2);
        assert_eq!(manager.num_committed_regions(), 6);
        assert_eq!(
            mapper.operations().last().copied(),
            Some((MemoryOp::Uncommit, manager.table().range_of(6, 8)))
        );
        assert_eq!(manager.committed_map().next_committable_range(0), 6..8);
        manager.committed_map().verify();
    }
}
