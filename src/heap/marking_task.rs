//! Per-worker marking state and the marking step.
//!
//! A task alternates between sweeping the mark bitmap of a claimed region and scanning the
//! objects it finds. Newly marked objects are pushed to the task's local queue only when the
//! sweep has already passed them (they are below the task's local finger, or below the global
//! finger for objects outside the current region). Everything else will be visited by some
//! sweep later, so every marked object is scanned and none needs to be queued twice.
//!
//! Work flows from the local queue to the global overflow stack when the queue fills up and
//! back when it runs low. Idle tasks steal from peers and finally take part in the
//! termination protocol.

use std::time::Instant;

use super::{
    concurrent_mark::ConcurrentMark,
    object_model::ObjectModel,
    options::MarkingOptions,
    region::HeapRegion,
    region_mark_stats::RegionMarkStatsCache,
    taskqueue::{TaskEntry, TaskQueue},
    terminator::TerminatorTerminator,
    words_to_bytes, MemRegion,
};
use crate::utils::number_seq::TruncatedSeq;

pub struct MarkingTask {
    worker_id: usize,
    queue: TaskQueue,
    stats_cache: RegionMarkStatsCache,

    /// Region being swept, if any.
    curr_region: Option<usize>,
    /// Sweep position in the current region. Everything below it has been visited.
    finger: usize,
    region_limit: usize,

    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,
    words_scanned_period: usize,
    refs_reached_period: usize,

    drain_stack_target_size: usize,
    entries_per_chunk: usize,
    array_slice_stride: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb_buffers: bool,

    step_start: Instant,
    time_target_ms: f64,
    calls: usize,
    elapsed_time_ms: f64,
    termination_time_ms: f64,
    aborted: usize,
    aborted_overflow: usize,
    aborted_timed_out: usize,
    aborted_satb: usize,
    aborted_termination: usize,
    step_times_ms: TruncatedSeq,
    marking_step_diff_ms: TruncatedSeq,
    cache_hits: usize,
    cache_misses: usize,

    transfer: Vec<TaskEntry>,
}

impl MarkingTask {
    pub fn new(worker_id: usize, options: &MarkingOptions) -> Self {
        Self {
            worker_id,
            queue: TaskQueue::new(options.task_queue_capacity),
            stats_cache: RegionMarkStatsCache::new(options.stats_cache_size),
            curr_region: None,
            finger: 0,
            region_limit: 0,
            words_scanned: 0,
            words_scanned_limit: 0,
            real_words_scanned_limit: 0,
            refs_reached: 0,
            refs_reached_limit: 0,
            real_refs_reached_limit: 0,
            words_scanned_period: options.words_scanned_period,
            refs_reached_period: options.refs_reached_period,
            drain_stack_target_size: options.drain_stack_target_size,
            entries_per_chunk: options.entries_per_chunk,
            array_slice_stride: options.array_slice_stride,
            has_aborted: false,
            has_timed_out: false,
            draining_satb_buffers: false,
            step_start: Instant::now(),
            time_target_ms: 0.0,
            calls: 0,
            elapsed_time_ms: 0.0,
            termination_time_ms: 0.0,
            aborted: 0,
            aborted_overflow: 0,
            aborted_timed_out: 0,
            aborted_satb: 0,
            aborted_termination: 0,
            step_times_ms: TruncatedSeq::new(10, TruncatedSeq::DEFAULT_ALPHA),
            marking_step_diff_ms: TruncatedSeq::new(10, TruncatedSeq::DEFAULT_ALPHA),
            cache_hits: 0,
            cache_misses: 0,
            transfer: Vec::with_capacity(options.entries_per_chunk),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out
    }

    pub fn set_has_aborted(&mut self) {
        self.has_aborted = true;
    }

    pub fn clear_has_aborted(&mut self) {
        self.has_aborted = false;
    }

    pub fn finger(&self) -> usize {
        self.finger
    }

    pub fn curr_region(&self) -> Option<usize> {
        self.curr_region
    }

    /// Prepares the task for a new marking cycle.
    pub fn reset(&mut self) {
        self.clear_region_fields();
        self.queue.clear();
        self.stats_cache.reset();
        self.calls = 0;
        self.elapsed_time_ms = 0.0;
        self.termination_time_ms = 0.0;
        self.aborted = 0;
        self.aborted_overflow = 0;
        self.aborted_timed_out = 0;
        self.aborted_satb = 0;
        self.aborted_termination = 0;
        self.cache_hits = 0;
        self.cache_misses = 0;
    }

    pub fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.finger = 0;
        self.region_limit = 0;
    }

    fn setup_for_region(&mut self, region: &HeapRegion) {
        log::trace!(target: "gc-marking", "[{}] setting up for region {}", self.worker_id, region.index());
        self.curr_region = Some(region.index());
        self.finger = region.bottom();
        self.region_limit = region.tams();
        if self.finger >= self.region_limit {
            self.giveup_current_region();
        }
    }

    fn giveup_current_region(&mut self) {
        self.clear_region_fields();
    }

    #[inline]
    fn move_finger_to(&mut self, addr: usize) {
        debug_assert!(addr < self.region_limit, "move_finger_to past the region limit");
        self.finger = addr;
    }

    /// Publishes cached liveness counts. Returns (hits, misses).
    pub fn flush_mark_stats_cache(&mut self, cm: &ConcurrentMark) -> (usize, usize) {
        let (hits, misses) = self.stats_cache.evict_all(cm.stats());
        self.cache_hits += hits;
        self.cache_misses += misses;
        (hits, misses)
    }

    pub fn clear_mark_stats_cache(&mut self, region: usize) {
        self.stats_cache.reset_region(region);
    }

    fn recalculate_limits(&mut self) {
        self.real_words_scanned_limit = self.words_scanned + self.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + self.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Brings the next clock call closer, used after operations that may take long.
    fn decrease_limits(&mut self) {
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * self.words_scanned_period / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * self.refs_reached_period / 4);
    }

    #[inline]
    fn check_limits(&mut self, cm: &ConcurrentMark) {
        if self.words_scanned >= self.words_scanned_limit || self.refs_reached >= self.refs_reached_limit {
            self.abort_marking_if_regular_check_fail(cm);
        }
    }

    fn abort_marking_if_regular_check_fail(&mut self, cm: &ConcurrentMark) {
        if !self.regular_clock_call(cm) {
            self.set_has_aborted();
        }
    }

    /// Periodic check whether the step has to stop. Returns `false` if it does.
    fn regular_clock_call(&mut self, cm: &ConcurrentMark) -> bool {
        if self.has_aborted {
            return false;
        }

        self.recalculate_limits();

        // Overflow has to be handled before anything else.
        if cm.has_overflown() {
            return false;
        }

        // Pauses run without a time budget and cannot be interrupted.
        if !cm.concurrent() {
            return true;
        }

        if cm.has_aborted() {
            return false;
        }

        if cm.yield_requested() {
            return false;
        }

        let elapsed_ms = self.step_start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > self.time_target_ms {
            self.has_timed_out = true;
            return false;
        }

        if !self.draining_satb_buffers && cm.satb_source().process_completed_buffers() {
            return false;
        }
        true
    }

    /// The bitmap sweep of the current region (or of the region at the global finger, when
    /// there is none) will still visit `addr`.
    #[inline]
    fn is_below_finger(&self, addr: usize, global_finger: usize) -> bool {
        if self.curr_region.is_some() {
            if addr < self.finger {
                return true;
            } else if addr < self.region_limit {
                return false;
            }
        }
        addr < global_finger
    }

    /// Marks `obj` in the next bitmap and counts its words. Returns `true` if this call
    /// marked it.
    fn mark_in_next_bitmap(&mut self, cm: &ConcurrentMark, obj: usize) -> bool {
        let heap = cm.heap();
        if !heap.is_in(obj) {
            return false;
        }

        let region = heap.table().region_containing(obj);
        if !region.is_below_tams(obj) {
            return false;
        }

        if !cm.next_bitmap().par_mark(obj) {
            return false;
        }

        let words = heap.model().size_in_words(obj);
        self.stats_cache.add_live_words(cm.stats(), region.index(), words);
        true
    }

    fn make_reference_grey(&mut self, cm: &ConcurrentMark, obj: usize) -> bool {
        if !self.mark_in_next_bitmap(cm, obj) {
            return false;
        }

        if self.is_below_finger(obj, cm.finger()) {
            let model = cm.heap().model();
            if model.may_contain_references(obj) {
                self.push(cm, TaskEntry::Obj(obj));
            } else {
                // Nothing to scan, just account for it.
                self.words_scanned += model.size_in_words(obj);
                self.check_limits(cm);
            }
        }
        true
    }

    #[inline]
    fn deal_with_reference(&mut self, cm: &ConcurrentMark, obj: usize) {
        self.refs_reached += 1;
        if obj != 0 {
            self.make_reference_grey(cm, obj);
        }
    }

    fn scan_task_entry(&mut self, cm: &ConcurrentMark, entry: TaskEntry) {
        let model = cm.heap().model();
        match entry {
            TaskEntry::Obj(obj) => match model.ref_array_length(obj) {
                Some(len) if len > self.array_slice_stride => {
                    self.scan_array_slice(cm, model, obj, 0, len);
                }
                Some(len) => {
                    model.trace_array_range(obj, 0, len, &mut |r| self.deal_with_reference(cm, r));
                    self.words_scanned += model.size_in_words(obj);
                }
                None => {
                    model.trace(obj, &mut |r| self.deal_with_reference(cm, r));
                    self.words_scanned += model.size_in_words(obj);
                }
            },
            TaskEntry::ArraySlice { array, from } => {
                let len = model.ref_array_length(array).unwrap_or(0);
                self.scan_array_slice(cm, model, array, from, len);
            }
        }
        self.check_limits(cm);
    }

    /// Scans one stride of `array` starting at `from`, pushing a continuation for the rest.
    fn scan_array_slice(&mut self, cm: &ConcurrentMark, model: &dyn ObjectModel, array: usize, from: usize, len: usize) {
        let to = (from + self.array_slice_stride).min(len);
        if to < len {
            self.push(cm, TaskEntry::ArraySlice { array, from: to });
        }
        model.trace_array_range(array, from, to, &mut |r| self.deal_with_reference(cm, r));
        self.words_scanned += to - from;
    }

    fn push(&mut self, cm: &ConcurrentMark, entry: TaskEntry) {
        if !self.queue.push(entry) {
            self.move_entries_to_global_stack(cm);
            // The transfer made room even if the global stack rejected it.
            let pushed = self.queue.push(entry);
            debug_assert!(pushed, "local queue still full after transfer");
        }
    }

    /// Moves half of the local queue, at most one chunk, to the global stack.
    fn move_entries_to_global_stack(&mut self, cm: &ConcurrentMark) {
        let n = (self.queue.len() / 2).max(1).min(self.entries_per_chunk);
        self.transfer.clear();
        while self.transfer.len() < n {
            match self.queue.pop() {
                Some(entry) => self.transfer.push(entry),
                None => break,
            }
        }

        if !self.transfer.is_empty() && !cm.mark_stack().par_push_chunk(&self.transfer) {
            // Entries are dropped: their objects are marked and marking restarts from the
            // bitmap, which visits them again.
            log::debug!(target: "gc-marking", "[{}] mark stack overflow", self.worker_id);
            cm.set_has_overflown();
            self.set_has_aborted();
        }
        self.transfer.clear();
        self.decrease_limits();
    }

    fn get_entries_from_global_stack(&mut self, cm: &ConcurrentMark) -> bool {
        self.transfer.clear();
        if !cm.mark_stack().par_pop_chunk(&mut self.transfer) {
            return false;
        }

        let mut entries = std::mem::take(&mut self.transfer);
        for entry in entries.drain(..) {
            if !self.queue.push(entry) {
                self.scan_task_entry(cm, entry);
            }
        }
        self.transfer = entries;
        self.decrease_limits();
        true
    }

    pub fn drain_local_queue(&mut self, cm: &ConcurrentMark, partially: bool) {
        if self.has_aborted {
            return;
        }

        let target_size = if partially {
            (self.queue.capacity() / 3).min(self.drain_stack_target_size)
        } else {
            0
        };

        if self.queue.len() > target_size {
            while let Some(entry) = self.queue.pop() {
                self.scan_task_entry(cm, entry);
                if self.queue.len() <= target_size || self.has_aborted {
                    break;
                }
            }
        }
    }

    pub fn drain_global_stack(&mut self, cm: &ConcurrentMark, partially: bool) {
        if self.has_aborted {
            return;
        }

        let target_size = if partially {
            cm.mark_stack().capacity_entries() / 3
        } else {
            0
        };

        while !self.has_aborted && cm.mark_stack().size() > target_size {
            if self.get_entries_from_global_stack(cm) {
                self.drain_local_queue(cm, partially);
            } else {
                break;
            }
        }
    }

    pub fn drain_satb_buffers(&mut self, cm: &ConcurrentMark) {
        if self.has_aborted {
            return;
        }

        // Stops the clock from aborting us because buffers are pending.
        self.draining_satb_buffers = true;

        while !self.has_aborted {
            let Some(buffer) = cm.satb_source().drain_next_buffer() else {
                break;
            };
            for obj in buffer {
                self.deal_with_reference(cm, obj);
            }
            self.abort_marking_if_regular_check_fail(cm);
        }

        self.draining_satb_buffers = false;
        self.decrease_limits();
    }

    /// Best-effort SATB drain after concurrent marking terminated. Whatever is left when the
    /// time runs out stays queued for remark.
    pub fn preclean(&mut self, cm: &ConcurrentMark, time_target_ms: f64) {
        self.step_start = Instant::now();
        self.time_target_ms = time_target_ms;
        self.has_aborted = false;
        self.has_timed_out = false;
        self.clear_region_fields();
        self.recalculate_limits();

        self.drain_satb_buffers(cm);
        self.drain_local_queue(cm, false);
        self.drain_global_stack(cm, false);
        self.record_step_time();
    }

    /// Marks every object in `mr` together with the objects it references. Referenced objects
    /// are not queued; the bitmap sweep finds them.
    pub fn scan_root_region(&mut self, cm: &ConcurrentMark, mr: MemRegion) {
        let model = cm.heap().model();
        let mut cur = mr.start();
        while cur < mr.end() {
            let words = model.size_in_words(cur);
            debug_assert!(words > 0, "zero-sized object at {:#x}", cur);
            self.mark_in_next_bitmap(cm, cur);

            match model.ref_array_length(cur) {
                Some(len) => model.trace_array_range(cur, 0, len, &mut |r| {
                    if r != 0 {
                        self.mark_in_next_bitmap(cm, r);
                    }
                }),
                None => model.trace(cur, &mut |r| {
                    if r != 0 {
                        self.mark_in_next_bitmap(cm, r);
                    }
                }),
            }
            cur += words_to_bytes(words.max(1));
        }
    }

    /// Scans the current region from the finger up to its limit. Returns `false` if the
    /// task aborted on the way.
    fn scan_current_region(&mut self, cm: &ConcurrentMark) -> bool {
        let mr = MemRegion::new(self.finger, self.region_limit);
        if mr.is_empty() {
            self.giveup_current_region();
            return true;
        }

        let completed = cm.next_bitmap().iterate(mr, |addr| {
            self.move_finger_to(addr);
            self.scan_task_entry(cm, TaskEntry::Obj(addr));
            self.drain_local_queue(cm, true);
            self.drain_global_stack(cm, true);
            !self.has_aborted
        });

        if completed {
            self.giveup_current_region();
        } else {
            // The object under the finger has been scanned, resume after it.
            let words = cm.heap().model().size_in_words(self.finger);
            let new_finger = self.finger + words_to_bytes(words.max(1));
            if new_finger >= self.region_limit {
                self.giveup_current_region();
            } else {
                self.move_finger_to(new_finger);
            }
        }
        completed
    }

    /// Runs marking until this task runs out of work or has to stop.
    ///
    /// `time_target_ms` only applies to concurrent steps. With `do_termination` the task
    /// offers termination once it finds no more work; `is_serial` marks a single task running
    /// without peers, which skips the termination protocol and the overflow barriers.
    /// Check [`MarkingTask::has_aborted`] afterwards: an aborted step has to be repeated.
    pub fn do_marking_step(&mut self, cm: &ConcurrentMark, time_target_ms: f64, do_termination: bool, is_serial: bool) {
        debug_assert!(time_target_ms >= 1.0, "minimum granularity is 1ms");
        self.step_start = Instant::now();

        let diff_prediction_ms = if self.marking_step_diff_ms.num() == 0 {
            0.5
        } else {
            self.marking_step_diff_ms.predict_zero_bounded()
        };
        self.time_target_ms = time_target_ms - diff_prediction_ms;

        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb_buffers = false;
        self.calls += 1;

        self.recalculate_limits();

        // Logged references first, they may refer to objects the sweep already passed.
        self.drain_satb_buffers(cm);
        self.drain_local_queue(cm, true);
        self.drain_global_stack(cm, true);

        loop {
            if !self.has_aborted && self.curr_region.is_some() {
                self.scan_current_region(cm);
            }

            self.drain_local_queue(cm, true);
            self.drain_global_stack(cm, true);

            while !self.has_aborted && self.curr_region.is_none() && !cm.out_of_regions() {
                if let Some(region) = cm.claim_region(self.worker_id) {
                    self.setup_for_region(region);
                }
                self.abort_marking_if_regular_check_fail(cm);
            }

            if self.curr_region.is_none() || self.has_aborted {
                break;
            }
        }

        if !self.has_aborted {
            debug_assert!(cm.out_of_regions(), "at this point we should be out of regions");
            self.drain_satb_buffers(cm);
        }

        self.drain_local_queue(cm, false);
        self.drain_global_stack(cm, false);

        if !is_serial {
            while !self.has_aborted {
                match cm.queues().steal(self.worker_id, cm.num_active_tasks(), &self.queue) {
                    Some(entry) => {
                        self.scan_task_entry(cm, entry);
                        self.drain_local_queue(cm, false);
                        self.drain_global_stack(cm, false);
                    }
                    None => break,
                }
            }
        }

        if do_termination && !self.has_aborted {
            let termination_start = Instant::now();
            let finished = is_serial
                || cm.terminator().offer_termination(&mut TerminationCheck { task: &mut *self, cm });
            self.termination_time_ms += termination_start.elapsed().as_secs_f64() * 1000.0;

            if finished {
                debug_assert!(self.queue.is_empty(), "only way to reach here");
                log::trace!(target: "gc-marking", "[{}] all tasks terminated", self.worker_id);
            } else {
                self.aborted_termination += 1;
                self.set_has_aborted();
            }
        }

        if self.has_aborted {
            self.aborted += 1;
            if self.has_timed_out {
                self.aborted_timed_out += 1;
                let diff_ms = self.step_start.elapsed().as_secs_f64() * 1000.0 - self.time_target_ms;
                self.marking_step_diff_ms.add(diff_ms);
            }

            if cm.has_overflown() {
                self.aborted_overflow += 1;
                log::debug!(target: "gc-marking", "[{}] aborted step on mark stack overflow", self.worker_id);

                if !is_serial && !cm.enter_first_sync_barrier(self.worker_id) {
                    self.record_step_time();
                    return;
                }

                // Everything the task still holds is rediscovered by the restarted sweep.
                self.clear_region_fields();
                self.queue.clear();
                self.flush_mark_stats_cache(cm);

                if !is_serial {
                    if self.worker_id == 0 && cm.concurrent() {
                        cm.reset_marking_for_restart();
                    }
                    cm.enter_second_sync_barrier(self.worker_id);
                }
            } else if !self.has_timed_out && cm.satb_source().process_completed_buffers() {
                self.aborted_satb += 1;
            }
        }

        self.record_step_time();
    }

    fn record_step_time(&mut self) {
        let elapsed_ms = self.step_start.elapsed().as_secs_f64() * 1000.0;
        self.elapsed_time_ms += elapsed_ms;
        self.step_times_ms.add(elapsed_ms);
    }

    pub fn print_stats(&self) {
        log::debug!(
            target: "gc-marking",
            "Marking Stats, task = {}, calls = {}, elapsed = {:.2}ms, termination = {:.2}ms",
            self.worker_id,
            self.calls,
            self.elapsed_time_ms,
            self.termination_time_ms
        );
        log::debug!(
            target: "gc-marking",
            "  Step Times (cum): num = {}, avg = {:.3}ms, sd = {:.3}ms, max = {:.3}ms",
            self.step_times_ms.num(),
            self.step_times_ms.avg(),
            self.step_times_ms.sd(),
            self.step_times_ms.maximum()
        );
        let total = self.cache_hits + self.cache_misses;
        log::debug!(
            target: "gc-marking",
            "  Mark Stats Cache: hits {} misses {} ratio {:.3}",
            self.cache_hits,
            self.cache_misses,
            if total == 0 { 0.0 } else { self.cache_hits as f64 / total as f64 }
        );
        log::debug!(
            target: "gc-marking",
            "  Aborted: {} (overflow {}, timed out {}, satb {}, termination {})",
            self.aborted,
            self.aborted_overflow,
            self.aborted_timed_out,
            self.aborted_satb,
            self.aborted_termination
        );
    }
}

/// What a task waiting in the terminator checks to find out whether it should go back to work.
struct TerminationCheck<'a> {
    task: &'a mut MarkingTask,
    cm: &'a ConcurrentMark,
}

impl TerminatorTerminator for TerminationCheck<'_> {
    fn should_exit_termination(&mut self) -> bool {
        if !self.task.regular_clock_call(self.cm) {
            return true;
        }

        // Leftover work anywhere means the task has to go back and help.
        !self.cm.mark_stack().is_empty()
            || self.cm.satb_source().completed_buffers_num() > 0
            || !self
                .cm
                .queues()
                .peers_empty(self.task.worker_id, self.cm.num_active_tasks())
            || self.task.has_aborted
    }
}
