//! Which regions are committed, and of those which are usable.
//!
//! Every region is in exactly one of three states:
//!
//! | state       | active bit | inactive bit |
//! |-------------|------------|--------------|
//! | Uncommitted | 0          | 0            |
//! | Active      | 1          | 0            |
//! | Inactive    | 0          | 1            |
//!
//! Inactive regions are still committed but empty and waiting to be uncommitted, possibly
//! by a background thread. They can be reactivated cheaply before that happens.
//!
//! The two bitmaps are protected separately. Changes to the active map race with the
//! allocation slow path and require an [`ActiveMapGuard`]. Changes to the inactive map are
//! driven by pause-time shrinking and background uncommit and require an
//! [`InactiveMapGuard`]. Readers never lock.

use std::{
    ops::Range,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

use crate::utils::bitmap::AtomicBitMap;

pub struct ActiveMapLock(());
pub struct InactiveMapLock(());

pub type ActiveMapGuard<'a> = MutexGuard<'a, ActiveMapLock>;
pub type InactiveMapGuard<'a> = MutexGuard<'a, InactiveMapLock>;

pub struct CommittedRegionMap {
    active: AtomicBitMap,
    inactive: AtomicBitMap,
    num_active: AtomicUsize,
    num_inactive: AtomicUsize,
    active_lock: Mutex<ActiveMapLock>,
    inactive_lock: Mutex<InactiveMapLock>,
}

impl CommittedRegionMap {
    pub fn new(num_regions: usize) -> Self {
        Self {
            active: AtomicBitMap::new(num_regions),
            inactive: AtomicBitMap::new(num_regions),
            num_active: AtomicUsize::new(0),
            num_inactive: AtomicUsize::new(0),
            active_lock: Mutex::new(ActiveMapLock(())),
            inactive_lock: Mutex::new(InactiveMapLock(())),
        }
    }

    pub fn max_length(&self) -> usize {
        self.active.size()
    }

    pub fn lock_active(&self) -> ActiveMapGuard<'_> {
        self.active_lock.lock()
    }

    pub fn lock_inactive(&self) -> InactiveMapGuard<'_> {
        self.inactive_lock.lock()
    }

    pub fn active(&self, index: usize) -> bool {
        self.active.at(index)
    }

    pub fn inactive(&self, index: usize) -> bool {
        self.inactive.at(index)
    }

    pub fn num_active(&self) -> usize {
        self.num_active.load(Ordering::Acquire)
    }

    pub fn num_inactive(&self) -> usize {
        self.num_inactive.load(Ordering::Acquire)
    }

    /// Uncommitted -> Active. The backing memory must already be committed.
    pub fn activate(&self, guard: &ActiveMapGuard<'_>, start: usize, end: usize) {
        self.verify_active_count(start, end, 0);
        self.verify_inactive_count(start, end, 0);
        log::debug!(target: "gc-region", "Activate regions [{}, {})", start, end);
        self.active_set_range(guard, start, end);
    }

    /// Inactive -> Active.
    pub fn reactivate(
        &self,
        active: &ActiveMapGuard<'_>,
        inactive: &InactiveMapGuard<'_>,
        start: usize,
        end: usize,
    ) {
        self.verify_active_count(start, end, 0);
        self.verify_inactive_count(start, end, end - start);
        log::debug!(target: "gc-region", "Reactivate regions [{}, {})", start, end);
        self.inactive_clear_range(inactive, start, end);
        self.active_set_range(active, start, end);
    }

    /// Active -> Inactive. The regions must be empty; their memory stays committed.
    pub fn deactivate(
        &self,
        active: &ActiveMapGuard<'_>,
        inactive: &InactiveMapGuard<'_>,
        start: usize,
        end: usize,
    ) {
        self.verify_active_count(start, end, end - start);
        self.verify_inactive_count(start, end, 0);
        log::debug!(target: "gc-region", "Deactivate regions [{}, {})", start, end);
        self.active_clear_range(active, start, end);
        self.inactive_set_range(inactive, start, end);
    }

    /// Inactive -> Uncommitted. The caller releases the backing memory.
    pub fn uncommit(&self, inactive: &InactiveMapGuard<'_>, start: usize, end: usize) {
        self.verify_active_count(start, end, 0);
        self.verify_inactive_count(start, end, end - start);
        log::debug!(target: "gc-region", "Uncommit regions [{}, {})", start, end);
        self.inactive_clear_range(inactive, start, end);
    }

    fn active_set_range(&self, guard: &ActiveMapGuard<'_>, start: usize, end: usize) {
        self.guarantee_mt_safety_active(guard);
        self.active.par_set_range(start, end);
        self.num_active.fetch_add(end - start, Ordering::AcqRel);
    }

    fn active_clear_range(&self, guard: &ActiveMapGuard<'_>, start: usize, end: usize) {
        self.guarantee_mt_safety_active(guard);
        self.active.par_clear_range(start, end);
        self.num_active.fetch_sub(end - start, Ordering::AcqRel);
    }

    fn inactive_set_range(&self, guard: &InactiveMapGuard<'_>, start: usize, end: usize) {
        self.guarantee_mt_safety_inactive(guard);
        self.inactive.par_set_range(start, end);
        self.num_inactive.fetch_add(end - start, Ordering::AcqRel);
    }

    fn inactive_clear_range(&self, guard: &InactiveMapGuard<'_>, start: usize, end: usize) {
        self.guarantee_mt_safety_inactive(guard);
        self.inactive.par_clear_range(start, end);
        self.num_inactive.fetch_sub(end - start, Ordering::AcqRel);
    }

    fn guarantee_mt_safety_active(&self, guard: &ActiveMapGuard<'_>) {
        debug_assert!(
            ptr::eq(MutexGuard::mutex(guard), &self.active_lock),
            "active map guard belongs to another map"
        );
    }

    fn guarantee_mt_safety_inactive(&self, guard: &InactiveMapGuard<'_>) {
        debug_assert!(
            ptr::eq(MutexGuard::mutex(guard), &self.inactive_lock),
            "inactive map guard belongs to another map"
        );
    }

    fn verify_active_count(&self, start: usize, end: usize, expected: usize) {
        debug_assert!(start < end, "empty region range [{}, {})", start, end);
        debug_assert_eq!(
            self.active.count_one_bits_in_range(start, end),
            expected,
            "Unexpected number of active regions in [{}, {})",
            start,
            end
        );
    }

    fn verify_inactive_count(&self, start: usize, end: usize, expected: usize) {
        debug_assert_eq!(
            self.inactive.count_one_bits_in_range(start, end),
            expected,
            "Unexpected number of inactive regions in [{}, {})",
            start,
            end
        );
    }

    /// First maximal run of active regions at or after `offset`. Empty if there is none.
    pub fn next_active_range(&self, offset: usize) -> Range<usize> {
        let max = self.max_length();
        let start = self.active.find_first_set_bit(offset.min(max), max);
        let end = self.active.find_first_clear_bit(start, max);
        start..end
    }

    /// First maximal run of inactive regions at or after `offset`. Empty if there is none.
    pub fn next_inactive_range(&self, offset: usize) -> Range<usize> {
        let max = self.max_length();
        let start = self.inactive.find_first_set_bit(offset.min(max), max);
        let end = self.inactive.find_first_clear_bit(start, max);
        start..end
    }

    /// First maximal run of uncommitted regions at or after `offset`. Empty if there is none.
    pub fn next_committable_range(&self, offset: usize) -> Range<usize> {
        let max = self.max_length();
        let mut start = offset.min(max);

        loop {
            start = self.active.find_first_clear_bit(start, max);
            if start == max || !self.inactive.at(start) {
                break;
            }
            start = self.inactive.find_first_clear_bit(start, max);
        }

        let end = self
            .active
            .find_first_set_bit(start, max)
            .min(self.inactive.find_first_set_bit(start, max));
        start..end
    }

    /// Checks that no region is both active and inactive.
    pub fn verify(&self) {
        let max = self.max_length();
        let mut active = 0;
        let mut inactive = 0;
        for i in 0..max {
            let (a, ia) = (self.active.at(i), self.inactive.at(i));
            assert!(!(a && ia), "region {} is both active and inactive", i);
            active += a as usize;
            inactive += ia as usize;
        }
        assert_eq!(active, self.num_active(), "active region count is out of sync");
        assert_eq!(inactive, self.num_inactive(), "inactive region count is out of sync");
    }
}
