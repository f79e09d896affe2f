use std::sync::atomic::{AtomicUsize, Ordering};

/// Live words found by the running marking cycle, per region.
pub struct RegionMarkStats {
    live_words: Vec<AtomicUsize>,
}

impl RegionMarkStats {
    pub fn new(num_regions: usize) -> Self {
        Self {
            live_words: (0..num_regions).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.live_words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_words.is_empty()
    }

    #[inline]
    pub fn add_live_words(&self, region: usize, words: usize) {
        self.live_words[region].fetch_add(words, Ordering::Relaxed);
    }

    pub fn live_words(&self, region: usize) -> usize {
        self.live_words[region].load(Ordering::Relaxed)
    }

    pub fn clear(&self, region: usize) {
        self.live_words[region].store(0, Ordering::Relaxed);
    }

    pub fn clear_all(&self) {
        for words in &self.live_words {
            words.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Clone, Copy)]
struct CacheEntry {
    region: usize,
    live_words: usize,
}

const EMPTY_REGION: usize = usize::MAX;

/// Per-task cache in front of [`RegionMarkStats`].
///
/// Direct-mapped: a region always lands in slot `region & (size - 1)`. Evicted and flushed
/// entries are added to the shared table.
pub struct RegionMarkStatsCache {
    entries: Box<[CacheEntry]>,
    mask: usize,
    hits: usize,
    misses: usize,
}

impl RegionMarkStatsCache {
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "cache size {} must be a power of two", size);
        Self {
            entries: vec![
                CacheEntry {
                    region: EMPTY_REGION,
                    live_words: 0
                };
                size
            ]
            .into_boxed_slice(),
            mask: size - 1,
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    pub fn add_live_words(&mut self, stats: &RegionMarkStats, region: usize, words: usize) {
        let entry = &mut self.entries[region & self.mask];
        if entry.region == region {
            self.hits += 1;
        } else {
            self.misses += 1;
            if entry.region != EMPTY_REGION && entry.live_words != 0 {
                stats.add_live_words(entry.region, entry.live_words);
            }
            entry.region = region;
            entry.live_words = 0;
        }
        entry.live_words += words;
    }

    /// Drops any cached count for `region` without publishing it.
    pub fn reset_region(&mut self, region: usize) {
        let entry = &mut self.entries[region & self.mask];
        if entry.region == region {
            entry.region = EMPTY_REGION;
            entry.live_words = 0;
        }
    }

    /// Publishes every cached count. Returns (hits, misses) since the last flush.
    pub fn evict_all(&mut self, stats: &RegionMarkStats) -> (usize, usize) {
        for entry in self.entries.iter_mut() {
            if entry.region != EMPTY_REGION && entry.live_words != 0 {
                stats.add_live_words(entry.region, entry.live_words);
            }
            entry.region = EMPTY_REGION;
            entry.live_words = 0;
        }
        let result = (self.hits, self.misses);
        self.hits = 0;
        self.misses = 0;
        result
    }

    /// Forgets everything, publishing nothing.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.region = EMPTY_REGION;
            entry.live_words = 0;
        }
        self.hits = 0;
        self.misses = 0;
    }
}
