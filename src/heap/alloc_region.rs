//! Lock-free bump allocation into a single current region.
//!
//! Any number of threads allocate from the current region with [`AllocRegion::attempt_allocation`],
//! which only CASes the region's top. When the region is exhausted one thread takes the slow
//! path under the allocation lock: it retires the region (formatting the unused tail as a
//! dummy object so late racers cannot allocate into it) and installs a fresh region from the
//! backend. The handle is replaced, never mutated in place.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use super::{bytes_to_words, region::HeapRegion, words_to_bytes};

/// Where alloc regions come from and go to.
pub trait AllocRegionBackend: Send + Sync {
    /// Hands out a region able to hold at least `min_words` words. `force` ignores soft
    /// limits on the number of regions used for allocation.
    fn allocate_new_region(&self, min_words: usize, force: bool) -> Option<&HeapRegion>;

    /// Called once a region stops being an alloc region.
    fn retire_region(&self, region: &HeapRegion, bytes_used: usize);

    /// Descriptor of a region previously handed out by `allocate_new_region`.
    fn region_at(&self, index: usize) -> &HeapRegion;

    fn fill_with_dummy_object(&self, start: usize, words: usize);

    fn min_filler_words(&self) -> usize;
}

const NO_REGION: usize = usize::MAX;

pub struct AllocRegion {
    name: &'static str,
    backend: Arc<dyn AllocRegionBackend>,
    /// Index of the current region, or `NO_REGION`.
    current: AtomicUsize,
    /// Spare region kept by the retained-region variant, or `NO_REGION`.
    retained: AtomicUsize,
    /// Minimum free bytes for a retired region to be kept as the retained region.
    /// `None` disables retaining.
    retain_min_bytes: Option<usize>,
    /// Distinct regions installed since the last `init`.
    count: AtomicUsize,
    used_bytes_before: AtomicUsize,
    wasted_bytes: AtomicUsize,
    max_retries: usize,
    lock: Mutex<()>,
}

impl AllocRegion {
    pub fn new(name: &'static str, backend: Arc<dyn AllocRegionBackend>, max_retries: usize) -> Self {
        Self::build(name, backend, max_retries, None)
    }

    /// Variant that keeps the emptier of the last two retired regions around and allocates
    /// into it before asking for a fresh region.
    pub fn with_retained_region(
        name: &'static str,
        backend: Arc<dyn AllocRegionBackend>,
        max_retries: usize,
        retain_min_bytes: usize,
    ) -> Self {
        Self::build(name, backend, max_retries, Some(retain_min_bytes))
    }

    fn build(
        name: &'static str,
        backend: Arc<dyn AllocRegionBackend>,
        max_retries: usize,
        retain_min_bytes: Option<usize>,
    ) -> Self {
        Self {
            name,
            backend,
            current: AtomicUsize::new(NO_REGION),
            retained: AtomicUsize::new(NO_REGION),
            retain_min_bytes,
            count: AtomicUsize::new(0),
            used_bytes_before: AtomicUsize::new(0),
            wasted_bytes: AtomicUsize::new(0),
            max_retries: max_retries.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resets the handle at the start of an allocation epoch.
    pub fn init(&self) {
        let _guard = self.lock.lock();
        assert_eq!(
            self.current.load(Ordering::Acquire),
            NO_REGION,
            "{}: init with an installed region",
            self.name
        );
        self.count.store(0, Ordering::Relaxed);
        self.used_bytes_before.store(0, Ordering::Relaxed);
    }

    fn region_at(&self, index: usize) -> &HeapRegion {
        self.backend.region_at(index)
    }

    pub fn get(&self) -> Option<&HeapRegion> {
        match self.current.load(Ordering::Acquire) {
            NO_REGION => None,
            index => Some(self.region_at(index)),
        }
    }

    pub fn retained_region(&self) -> Option<&HeapRegion> {
        match self.retained.load(Ordering::Acquire) {
            NO_REGION => None,
            index => Some(self.region_at(index)),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn wasted_bytes(&self) -> usize {
        self.wasted_bytes.load(Ordering::Relaxed)
    }

    /// Bytes allocated in regions retired since `init`, plus what the current region holds.
    pub fn used_in_alloc_regions(&self) -> usize {
        let current = self.get().map(|r| r.used()).unwrap_or(0);
        let retained = self.retained_region().map(|r| r.used()).unwrap_or(0);
        self.used_bytes_before.load(Ordering::Relaxed) + current + retained
    }

    /// Fast path: allocates between `min_words` and `desired_words` words in the current
    /// region. Returns the address and the size actually allocated.
    #[inline]
    pub fn attempt_allocation(&self, min_words: usize, desired_words: usize) -> Option<(usize, usize)> {
        let region = self.get()?;
        region.par_allocate(min_words, desired_words, self.max_retries)
    }

    pub fn attempt_retained_allocation(
        &self,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(usize, usize)> {
        let region = self.retained_region()?;
        region.par_allocate(min_words, desired_words, self.max_retries)
    }

    /// Slow path: retries the current region under the lock, then replaces it.
    pub fn attempt_allocation_locked(
        &self,
        min_words: usize,
        desired_words: usize,
    ) -> Option<(usize, usize)> {
        let _guard = self.lock.lock();

        // Another thread may have replaced the region while we waited for the lock.
        if let Some(result) = self.attempt_allocation(min_words, desired_words) {
            return Some(result);
        }

        self.retire_locked(true);
        self.new_alloc_region_and_allocate(min_words, desired_words, false)
    }

    /// Installs a new region ignoring region-count limits and allocates `words` in it.
    pub fn attempt_allocation_force(&self, words: usize) -> Option<(usize, usize)> {
        let _guard = self.lock.lock();
        log::trace!(target: "gc-alloc", "{}: forcing allocation of {} words", self.name, words);
        self.retire_locked(true);
        self.new_alloc_region_and_allocate(words, words, true)
    }

    /// Retained region, then current region, then the slow path.
    pub fn allocate(&self, min_words: usize, desired_words: usize) -> Option<(usize, usize)> {
        self.attempt_retained_allocation(min_words, desired_words)
            .or_else(|| self.attempt_allocation(min_words, desired_words))
            .or_else(|| self.attempt_allocation_locked(min_words, desired_words))
    }

    fn new_alloc_region_and_allocate(
        &self,
        min_words: usize,
        desired_words: usize,
        force: bool,
    ) -> Option<(usize, usize)> {
        let region = self.backend.allocate_new_region(min_words, force)?;

        // Nobody else can see the region yet, so this cannot race.
        let result = region.par_allocate(min_words, desired_words, self.max_retries);
        debug_assert!(result.is_some(), "{}: fresh region too small", self.name);

        self.current.store(region.index(), Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "gc-alloc", "{}: installed region {} (count {})", self.name, region.index(), self.count());
        result
    }

    /// Formats the free tail of `region` as a dummy object so no racing fast-path allocation
    /// can succeed in it any more. Returns the bytes lost.
    fn fill_up_remaining_space(&self, region: &HeapRegion) -> usize {
        let min_filler = self.backend.min_filler_words();
        loop {
            let free_words = bytes_to_words(region.free());
            if free_words < min_filler {
                return words_to_bytes(free_words);
            }

            if let Some((start, words)) = region.par_allocate(free_words, free_words, 1) {
                self.backend.fill_with_dummy_object(start, words);
                return words_to_bytes(words);
            }
        }
    }

    fn retire_internal(&self, region: &HeapRegion, fill_up: bool) -> usize {
        let waste = if fill_up {
            self.fill_up_remaining_space(region)
        } else {
            0
        };
        let used = region.used();
        self.backend.retire_region(region, used);
        self.used_bytes_before.fetch_add(used, Ordering::Relaxed);
        waste
    }

    fn should_retain(&self, region: &HeapRegion) -> bool {
        let Some(min_bytes) = self.retain_min_bytes else {
            return false;
        };

        let free = region.free();
        if free < min_bytes {
            return false;
        }
        self.retained_region()
            .map_or(true, |retained| free >= retained.free())
    }

    fn retire_locked(&self, fill_up: bool) -> Option<&HeapRegion> {
        let index = self.current.swap(NO_REGION, Ordering::AcqRel);
        if index == NO_REGION {
            return None;
        }

        let region = self.region_at(index);
        let waste = if self.should_retain(region) {
            log::trace!(target: "gc-alloc", "{}: retaining region {}", self.name, index);
            let previous = self.retained.swap(index, Ordering::AcqRel);
            if previous != NO_REGION {
                self.retire_internal(self.region_at(previous), true)
            } else {
                0
            }
        } else {
            self.retire_internal(region, fill_up)
        };
        self.wasted_bytes.fetch_add(waste, Ordering::Relaxed);
        Some(region)
    }

    /// Retires the current region, filling its tail.
    pub fn retire(&self) {
        let _guard = self.lock.lock();
        self.retire_locked(true);
    }

    /// Retires and clears the current region and drops the retained one. Returns the region
    /// that was current, if any. Calling it again is a no-op.
    pub fn release(&self) -> Option<&HeapRegion> {
        let _guard = self.lock.lock();
        let index = self.current.swap(NO_REGION, Ordering::AcqRel);
        let released = if index != NO_REGION {
            let region = self.region_at(index);
            self.retire_internal(region, false);
            Some(region)
        } else {
            None
        };

        let retained = self.retained.swap(NO_REGION, Ordering::AcqRel);
        if retained != NO_REGION {
            let waste = self.retire_internal(self.region_at(retained), false);
            self.wasted_bytes.fetch_add(waste, Ordering::Relaxed);
        }
        released
    }
}
