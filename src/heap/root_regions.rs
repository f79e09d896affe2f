use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::monitor::Monitor;

use super::{shared_vars::SharedFlag, MemRegion};

/// Memory ranges whose objects must be treated as roots by the next marking cycle, typically
/// what survived the previous one. Workers claim them one at a time with
/// [`RootRegions::claim_next`]; the scan must finish before anything can move objects in them.
pub struct RootRegions {
    starts: Box<[AtomicUsize]>,
    ends: Box<[AtomicUsize]>,
    num_root_regions: AtomicUsize,
    claimed: AtomicUsize,
    scan_in_progress: SharedFlag,
    should_abort: SharedFlag,
    scan_lock: Monitor<()>,
}

impl RootRegions {
    pub fn new(max_regions: usize) -> Self {
        Self {
            starts: (0..max_regions).map(|_| AtomicUsize::new(0)).collect(),
            ends: (0..max_regions).map(|_| AtomicUsize::new(0)).collect(),
            num_root_regions: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            scan_in_progress: SharedFlag::new(),
            should_abort: SharedFlag::new(),
            scan_lock: Monitor::new(()),
        }
    }

    pub fn max_regions(&self) -> usize {
        self.starts.len()
    }

    pub fn num_root_regions(&self) -> usize {
        self.num_root_regions.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.num_root_regions.store(0, Ordering::Release);
    }

    pub fn add(&self, start: usize, end: usize) {
        assert!(start < end, "empty root region [{:#x}, {:#x})", start, end);
        let index = self.num_root_regions.fetch_add(1, Ordering::AcqRel);
        assert!(
            index < self.max_regions(),
            "Trying to add more root regions than there is space {}",
            self.max_regions()
        );
        self.starts[index].store(start, Ordering::Relaxed);
        self.ends[index].store(end, Ordering::Release);
    }

    pub fn contains(&self, mr: MemRegion) -> bool {
        (0..self.num_root_regions()).any(|i| self.region_at(i) == mr)
    }

    fn region_at(&self, index: usize) -> MemRegion {
        let end = self.ends[index].load(Ordering::Acquire);
        MemRegion::new(self.starts[index].load(Ordering::Relaxed), end)
    }

    /// Starts a scan and resets the claim cursor. The scan counts as in progress, even with
    /// an empty list, until [`RootRegions::scan_finished`] or [`RootRegions::cancel_scan`].
    pub fn prepare_for_scan(&self) {
        assert!(!self.scan_in_progress(), "pre-condition");
        self.scan_in_progress.set();
        self.claimed.store(0, Ordering::Release);
        self.should_abort.unset();
    }

    /// Next unclaimed root region, or `None` once all are claimed or the scan was aborted.
    pub fn claim_next(&self) -> Option<MemRegion> {
        if self.should_abort.is_set() {
            return None;
        }

        let num = self.num_root_regions();
        if self.claimed.load(Ordering::Relaxed) >= num {
            return None;
        }

        let claimed = self.claimed.fetch_add(1, Ordering::AcqRel);
        if claimed < num {
            Some(self.region_at(claimed))
        } else {
            None
        }
    }

    /// Makes every later [`RootRegions::claim_next`] return `None`.
    pub fn abort(&self) {
        self.should_abort.set();
    }

    pub fn is_aborted(&self) -> bool {
        self.should_abort.is_set()
    }

    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress.is_set()
    }

    /// Called once all workers stopped claiming. Clears the list.
    pub fn scan_finished(&self) {
        if !self.should_abort.is_set() {
            debug_assert!(
                self.claimed.load(Ordering::Relaxed) >= self.num_root_regions(),
                "we should have claimed all root regions, claimed {}, length = {}",
                self.claimed.load(Ordering::Relaxed),
                self.num_root_regions()
            );
        }
        self.num_root_regions.store(0, Ordering::Release);
        self.notify_scan_done();
    }

    pub fn notify_scan_done(&self) {
        let lock = self.scan_lock.lock();
        self.scan_in_progress.unset();
        lock.notify_all();
    }

    /// Ends a scan that will not run to completion. The list is cleared like on
    /// [`RootRegions::scan_finished`].
    pub fn cancel_scan(&self) {
        self.num_root_regions.store(0, Ordering::Release);
        self.notify_scan_done();
    }

    /// Blocks until the running scan, if any, is done. Returns whether it had to wait.
    pub fn wait_until_scan_finished(&self) -> bool {
        if !self.scan_in_progress() {
            return false;
        }

        let mut lock = self.scan_lock.lock();
        while self.scan_in_progress() {
            lock.wait();
        }
        true
    }
}
