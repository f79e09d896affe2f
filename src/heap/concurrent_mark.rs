//! Concurrent marking coordinator.
//!
//! A cycle runs through these phases:
//!
//! 1. [`ConcurrentMark::pre_concurrent_start`] (pause): clear the next bitmap, reset marking
//!    state, snapshot TAMS of every region and turn on SATB logging.
//! 2. [`ConcurrentMark::scan_root_regions`]: mark the objects of the registered root regions
//!    and everything they reference.
//! 3. [`ConcurrentMark::mark_from_roots`]: the marking tasks sweep the bitmap region by region
//!    and trace until they agree to terminate.
//! 4. [`ConcurrentMark::preclean`]: drain SATB buffers that piled up meanwhile.
//! 5. [`ConcurrentMark::remark`] (pause): flush the remaining SATB buffers and finish marking.
//!    If the global mark stack overflowed, marking restarts at step 3 with a larger stack.
//! 6. [`ConcurrentMark::cleanup`] (pause): publish liveness, swap bitmaps and free regions
//!    without live objects.
//!
//! [`ConcurrentMark::run_cycle`] runs them in order.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use atomic::Atomic;
use parking_lot::Mutex;
use scoped_thread_pool::Pool;

use super::{
    heap::Heap,
    mark_bitmap::MarkBitmap,
    mark_stack::MarkStack,
    marking_task::MarkingTask,
    options::MarkingOptions,
    region::{HeapRegion, RegionKind},
    region_mark_stats::RegionMarkStats,
    root_regions::RootRegions,
    satb_mark_queue::{SatbBufferSource, SatbMarkQueueSet},
    shared_vars::SharedFlag,
    taskqueue::TaskQueueSet,
    terminator::TaskTerminator,
    words_to_bytes, bytes_to_words, ConcurrentPhase, PausePhase,
};
use crate::{
    sync::{barrier_sync::WorkerBarrierSync, monitor::Monitor},
    utils::{formatted_size, number_seq::TruncatedSeq},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkPhase {
    Idle,
    ConcurrentStart,
    ScanRootRegions,
    ConcurrentMark,
    Preclean,
    Remark,
    Cleanup,
}

/// Time budget of a step that must not be interrupted.
const UNBOUNDED_STEP_MS: f64 = 1_000_000_000.0;

pub struct ConcurrentMark {
    heap: Arc<Heap>,
    options: MarkingOptions,
    heap_start: usize,
    heap_end: usize,

    bitmaps: [MarkBitmap; 2],
    /// Index into `bitmaps` of the bitmap the running cycle fills.
    next_bitmap: AtomicUsize,

    mark_stack: MarkStack,
    /// Bottom of the next region to be claimed. Everything below it is claimed.
    finger: AtomicUsize,
    root_regions: RootRegions,
    stats: RegionMarkStats,
    satb: SatbMarkQueueSet,

    tasks: Vec<Mutex<MarkingTask>>,
    queues: TaskQueueSet,
    num_active_tasks: AtomicUsize,
    terminator: TaskTerminator,
    first_overflow_barrier_sync: WorkerBarrierSync,
    second_overflow_barrier_sync: WorkerBarrierSync,

    has_overflown: SharedFlag,
    has_aborted: SharedFlag,
    concurrent: SharedFlag,
    restart_for_overflow: SharedFlag,
    yield_requested: SharedFlag,
    yield_lock: Monitor<()>,

    workers: Pool,
    cycle: AtomicUsize,
    phase: Atomic<MarkPhase>,
    remark_times: Mutex<TruncatedSeq>,
    cleanup_times: Mutex<TruncatedSeq>,
    restarts: AtomicUsize,
    reclaimed_regions: AtomicUsize,
}

impl ConcurrentMark {
    pub fn new(heap: Arc<Heap>, mut options: MarkingOptions) -> Self {
        options.sanitize();
        let reserved = heap.table().reserved();
        let max_workers = options.max_workers();

        let tasks = (0..max_workers)
            .map(|worker_id| MarkingTask::new(worker_id, &options))
            .collect::<Vec<_>>();
        let queues = TaskQueueSet::new(tasks.iter().map(|task| task.queue().stealer()).collect());

        log::info!(
            target: "gc-marking",
            "Concurrent marking: {} parallel / {} concurrent workers, mark stack {} chunks (max {})",
            options.parallel_gc_threads,
            options.conc_gc_threads,
            options.mark_stack_size,
            options.mark_stack_size_max
        );

        Self {
            heap_start: reserved.start(),
            heap_end: reserved.end(),
            bitmaps: [MarkBitmap::new(reserved), MarkBitmap::new(reserved)],
            next_bitmap: AtomicUsize::new(0),
            mark_stack: MarkStack::new(
                options.mark_stack_size,
                options.mark_stack_size_max,
                options.entries_per_chunk,
            ),
            finger: AtomicUsize::new(reserved.end()),
            root_regions: RootRegions::new(heap.table().len()),
            stats: RegionMarkStats::new(heap.table().len()),
            satb: SatbMarkQueueSet::new(options.satb_buffer_size, options.satb_process_threshold),
            tasks: tasks.into_iter().map(Mutex::new).collect(),
            queues,
            num_active_tasks: AtomicUsize::new(0),
            terminator: TaskTerminator::new(
                max_workers,
                Duration::from_micros(options.termination_spin_us),
            ),
            first_overflow_barrier_sync: WorkerBarrierSync::new(max_workers),
            second_overflow_barrier_sync: WorkerBarrierSync::new(max_workers),
            has_overflown: SharedFlag::new(),
            has_aborted: SharedFlag::new(),
            concurrent: SharedFlag::new(),
            restart_for_overflow: SharedFlag::new(),
            yield_requested: SharedFlag::new(),
            yield_lock: Monitor::new(()),
            workers: Pool::new(max_workers),
            cycle: AtomicUsize::new(0),
            phase: Atomic::new(MarkPhase::Idle),
            remark_times: Mutex::new(TruncatedSeq::new(10, TruncatedSeq::DEFAULT_ALPHA)),
            cleanup_times: Mutex::new(TruncatedSeq::new(10, TruncatedSeq::DEFAULT_ALPHA)),
            restarts: AtomicUsize::new(0),
            reclaimed_regions: AtomicUsize::new(0),
            heap,
            options,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn options(&self) -> &MarkingOptions {
        &self.options
    }

    pub fn next_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_bitmap.load(Ordering::Acquire)]
    }

    /// Bitmap of the last completed marking.
    pub fn prev_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.next_bitmap.load(Ordering::Acquire)]
    }

    pub fn mark_stack(&self) -> &MarkStack {
        &self.mark_stack
    }

    pub fn root_regions(&self) -> &RootRegions {
        &self.root_regions
    }

    pub fn stats(&self) -> &RegionMarkStats {
        &self.stats
    }

    pub fn satb(&self) -> &SatbMarkQueueSet {
        &self.satb
    }

    pub fn satb_source(&self) -> &dyn SatbBufferSource {
        &self.satb
    }

    pub fn terminator(&self) -> &TaskTerminator {
        &self.terminator
    }

    pub fn queues(&self) -> &TaskQueueSet {
        &self.queues
    }

    pub fn num_active_tasks(&self) -> usize {
        self.num_active_tasks.load(Ordering::Acquire)
    }

    pub fn max_num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn cycle(&self) -> usize {
        self.cycle.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> MarkPhase {
        self.phase.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: MarkPhase) {
        self.phase.store(phase, Ordering::Release);
    }

    /// Number of times marking restarted after a mark stack overflow.
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Regions freed by the last cleanup.
    pub fn reclaimed_regions(&self) -> usize {
        self.reclaimed_regions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn finger(&self) -> usize {
        self.finger.load(Ordering::SeqCst)
    }

    pub fn out_of_regions(&self) -> bool {
        self.finger() >= self.heap_end
    }

    pub fn has_overflown(&self) -> bool {
        self.has_overflown.is_set()
    }

    pub fn set_has_overflown(&self) {
        self.has_overflown.set();
    }

    pub fn clear_has_overflown(&self) {
        self.has_overflown.unset();
    }

    pub fn has_aborted(&self) -> bool {
        self.has_aborted.is_set()
    }

    pub fn concurrent(&self) -> bool {
        self.concurrent.is_set()
    }

    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.is_set()
    }

    pub fn yield_requested(&self) -> bool {
        self.yield_requested.is_set()
    }

    /// Asks concurrent workers to stop at their next clock check and wait in
    /// [`ConcurrentMark::do_yield_check`] until [`ConcurrentMark::clear_yield`].
    pub fn request_yield(&self) {
        let _lock = self.yield_lock.lock();
        self.yield_requested.set();
    }

    pub fn clear_yield(&self) {
        let lock = self.yield_lock.lock();
        self.yield_requested.unset();
        lock.notify_all();
    }

    /// Blocks the calling worker while a yield is requested. Returns whether it waited.
    pub fn do_yield_check(&self) -> bool {
        if !self.yield_requested() {
            return false;
        }
        let mut lock = self.yield_lock.lock();
        while self.yield_requested() {
            lock.wait();
        }
        true
    }

    /// Claims the next region for `worker_id` by moving the global finger past it. Returns
    /// `None` when the claimed region has nothing to mark; callers just ask again until
    /// [`ConcurrentMark::out_of_regions`].
    pub fn claim_region(&self, worker_id: usize) -> Option<&HeapRegion> {
        let mut finger = self.finger();
        while finger < self.heap_end {
            let region = self.heap.table().region_containing(finger);
            let bottom = region.bottom();
            let end = region.end();
            let limit = region.tams();
            debug_assert_eq!(bottom, finger, "the finger always points at a region bottom");

            match self
                .finger
                .compare_exchange(finger, end, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    if limit > bottom {
                        log::trace!(target: "gc-marking", "[{}] claimed region {}", worker_id, region.index());
                        return Some(region);
                    }
                    return None;
                }
                Err(current) => finger = current,
            }
        }
        None
    }

    fn set_concurrency(&self, active_tasks: usize) {
        debug_assert!(active_tasks >= 1 && active_tasks <= self.tasks.len());
        self.num_active_tasks.store(active_tasks, Ordering::Release);
        self.terminator.reset_for_reuse(active_tasks);
        self.first_overflow_barrier_sync.set_n_workers(active_tasks);
        self.second_overflow_barrier_sync.set_n_workers(active_tasks);
    }

    pub fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        self.set_concurrency(active_tasks);
        self.concurrent.set_cond(concurrent);
    }

    /// Waits until all active tasks stopped marking after an overflow. Returns `false` if the
    /// barrier was aborted, in which case the task must leave the step immediately.
    pub fn enter_first_sync_barrier(&self, worker_id: usize) -> bool {
        log::trace!(target: "gc-marking", "[{}] entering first barrier", worker_id);
        let entered = self.first_overflow_barrier_sync.enter();
        log::trace!(target: "gc-marking", "[{}] leaving first barrier", worker_id);
        entered
    }

    pub fn enter_second_sync_barrier(&self, worker_id: usize) -> bool {
        log::trace!(target: "gc-marking", "[{}] entering second barrier", worker_id);
        self.second_overflow_barrier_sync.enter()
    }

    /// Empties the global stack, growing it if it overflowed, and moves the finger back to the
    /// start of the heap so the bitmap sweep rediscovers what got dropped. Marks and liveness
    /// counts are kept. Only valid while no task is marking.
    pub fn reset_marking_for_restart(&self) {
        self.mark_stack.set_empty();
        if self.has_overflown() {
            self.mark_stack.expand();
            log::info!(
                target: "gc-marking",
                "Mark stack overflow, restarting marking with {} chunks",
                self.mark_stack.capacity()
            );
        }
        self.clear_has_overflown();
        self.finger.store(self.heap_start, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.has_aborted.unset();
        self.restart_for_overflow.unset();
        self.reset_marking_for_restart();
        for task in &self.tasks {
            task.lock().reset();
        }
        self.stats.clear_all();
        self.first_overflow_barrier_sync.set_n_workers(self.tasks.len());
        self.second_overflow_barrier_sync.set_n_workers(self.tasks.len());
    }

    /// Start of a cycle. Must run while mutators are stopped.
    pub fn pre_concurrent_start(&self) {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        self.set_phase(MarkPhase::ConcurrentStart);
        let _phase = PausePhase::new("Concurrent Start", cycle);

        self.next_bitmap().clear_all();
        self.reset();
        for region in self.heap.regions().active_regions() {
            region.note_start_of_marking();
        }
        self.satb.set_active(true);

        if !self.root_regions.scan_in_progress() {
            self.root_regions.prepare_for_scan();
        }
    }

    /// Marks the objects in the registered root regions and their direct referents.
    pub fn scan_root_regions(&self) {
        if !self.root_regions.scan_in_progress() {
            return;
        }

        self.set_phase(MarkPhase::ScanRootRegions);
        let _phase = ConcurrentPhase::new("Scan Root Regions", self.cycle());

        let num_workers = self
            .options
            .conc_gc_threads
            .min(self.root_regions.num_root_regions())
            .min(self.tasks.len());
        if num_workers > 0 {
            log::debug!(
                target: "gc-marking",
                "Scanning {} root regions with {} workers",
                self.root_regions.num_root_regions(),
                num_workers
            );
            self.workers.scoped(|scope| {
                for worker_id in 0..num_workers {
                    scope.execute(move || {
                        let mut task = self.tasks[worker_id].lock();
                        while let Some(mr) = self.root_regions.claim_next() {
                            task.scan_root_region(self, mr);
                        }
                    });
                }
            });
        }
        self.root_regions.scan_finished();
    }

    fn calc_active_conc_workers(&self) -> usize {
        self.options.conc_gc_threads.min(self.tasks.len()).max(1)
    }

    fn concurrent_marking_work(&self, worker_id: usize) {
        if self.has_aborted() {
            return;
        }

        let mut task = self.tasks[worker_id].lock();
        let step_ms = self.options.marking_step_ms;
        loop {
            task.do_marking_step(self, step_ms, true, false);
            self.do_yield_check();
            if self.has_aborted() || !task.has_aborted() {
                break;
            }
        }
    }

    /// Concurrent marking to a fixpoint with the concurrent worker gang.
    pub fn mark_from_roots(&self) {
        self.set_phase(MarkPhase::ConcurrentMark);
        let _phase = ConcurrentPhase::new("Mark From Roots", self.cycle());
        self.restart_for_overflow.unset();

        let active = self.calc_active_conc_workers();
        self.set_concurrency_and_phase(active, true);
        log::debug!(target: "gc-marking", "Using {} workers of {} for marking", active, self.tasks.len());

        self.workers.scoped(|scope| {
            for worker_id in 0..active {
                scope.execute(move || self.concurrent_marking_work(worker_id));
            }
        });
        self.print_stats();
    }

    /// Drains SATB buffers that completed during concurrent marking, so remark has less to do.
    pub fn preclean(&self) {
        if self.has_aborted() {
            return;
        }

        self.set_phase(MarkPhase::Preclean);
        let _phase = ConcurrentPhase::new("Preclean", self.cycle());
        self.set_concurrency_and_phase(1, true);

        let mut task = self.tasks[0].lock();
        task.preclean(self, self.options.marking_step_ms);
    }

    /// Whether a logged reference still has to be marked.
    fn requires_marking(&self, obj: usize) -> bool {
        if !self.heap.is_in(obj) {
            return false;
        }
        let region = self.heap.table().region_containing(obj);
        region.is_below_tams(obj) && !self.next_bitmap().is_marked(obj)
    }

    fn finalize_marking(&self) {
        let active = self.options.parallel_gc_threads.min(self.tasks.len()).max(1);
        self.set_concurrency_and_phase(active, false);

        self.workers.scoped(|scope| {
            for worker_id in 0..active {
                scope.execute(move || {
                    let mut task = self.tasks[worker_id].lock();
                    loop {
                        task.do_marking_step(self, UNBOUNDED_STEP_MS, true, false);
                        if !task.has_aborted() || self.has_overflown() {
                            break;
                        }
                    }
                });
            }
        });
    }

    /// Finishes marking with mutators stopped. On a mark stack overflow the marking state is
    /// reset and [`ConcurrentMark::restart_for_overflow`] reports that concurrent marking has
    /// to run again.
    pub fn remark(&self) {
        if self.has_aborted() {
            return;
        }

        self.set_phase(MarkPhase::Remark);
        let start = Instant::now();
        let _phase = PausePhase::new("Remark", self.cycle());

        self.satb.flush_all_queues(|obj| self.requires_marking(obj));
        self.finalize_marking();

        if self.has_overflown() {
            log::info!(target: "gc-marking", "Remark led to restart for overflow");
            self.restarts.fetch_add(1, Ordering::Relaxed);
            self.restart_for_overflow.set();
            self.reset_marking_for_restart();
            return;
        }

        debug_assert!(self.mark_stack.is_empty(), "mark stack should be empty after remark");
        self.flush_all_task_caches();
        self.satb.set_active(false);
        self.remark_times
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Publishes liveness, swaps the bitmaps and frees regions without live objects.
    pub fn cleanup(&self) {
        if self.has_aborted() {
            return;
        }

        self.set_phase(MarkPhase::Cleanup);
        let start = Instant::now();
        let _phase = PausePhase::new("Cleanup", self.cycle());

        self.flush_all_task_caches();
        self.next_bitmap.fetch_xor(1, Ordering::AcqRel);

        let mut total_live = 0;
        let mut reclaimed = vec![];
        for region in self.heap.regions().active_regions() {
            let marked = self.stats.live_words(region.index());
            // Objects allocated during the cycle are live by definition.
            let allocated_since = bytes_to_words(region.top() - region.tams());
            region.set_live_words(marked + allocated_since);
            total_live += marked + allocated_since;

            if region.kind() == RegionKind::Old
                && region.used() > 0
                && marked == 0
                && region.top() == region.tams()
            {
                reclaimed.push(region.index());
            }
        }

        for &index in &reclaimed {
            let region = self.heap.table().at(index);
            self.prev_bitmap().clear_range(region.mem_region());
            self.heap.regions().free_region(region);
        }
        self.reclaimed_regions.store(reclaimed.len(), Ordering::Relaxed);

        log::info!(
            target: "gc",
            "GC({}) Cleanup: {} live, {} regions reclaimed",
            self.cycle(),
            formatted_size(words_to_bytes(total_live)),
            reclaimed.len()
        );
        self.cleanup_times
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
        self.set_phase(MarkPhase::Idle);
    }

    /// Stops the running cycle as soon as possible. Tasks notice at their next clock check,
    /// workers waiting on an overflow barrier are released.
    pub fn concurrent_cycle_abort(&self) {
        if self.phase() == MarkPhase::Idle || self.has_aborted() {
            return;
        }

        log::info!(target: "gc", "GC({}) Concurrent Mark Abort", self.cycle());
        self.has_aborted.set();
        self.root_regions.abort();
        if self.phase() == MarkPhase::ConcurrentStart {
            // Nobody is scanning yet, so nobody would end the scan.
            self.root_regions.cancel_scan();
        } else {
            // Ranges of this cycle must not leak into the next one.
            self.root_regions.reset();
        }
        self.first_overflow_barrier_sync.abort();
        self.second_overflow_barrier_sync.abort();
        self.satb.abandon_partial_marking();
        self.satb.set_active(false);
    }

    /// Runs a whole cycle. Returns `false` if it was aborted.
    pub fn run_cycle(&self) -> bool {
        self.pre_concurrent_start();
        self.scan_root_regions();

        loop {
            if self.has_aborted() {
                break;
            }
            self.mark_from_roots();
            if self.has_aborted() {
                break;
            }
            self.preclean();
            self.remark();
            if !self.restart_for_overflow() {
                break;
            }
            log::debug!(target: "gc-marking", "Restarting concurrent marking after overflow");
        }

        if self.has_aborted() {
            if self.root_regions.scan_in_progress() {
                self.root_regions.cancel_scan();
            }
            self.set_phase(MarkPhase::Idle);
            return false;
        }

        self.cleanup();
        true
    }

    /// Moves every task's cached liveness counts to the shared table.
    pub fn flush_all_task_caches(&self) {
        let mut hits = 0;
        let mut misses = 0;
        for task in &self.tasks {
            let (h, m) = task.lock().flush_mark_stats_cache(self);
            hits += h;
            misses += m;
        }
        let total = hits + misses;
        log::debug!(
            target: "gc-marking",
            "Mark stats cache hits {} misses {} ratio {:.3}",
            hits,
            misses,
            if total == 0 { 0.0 } else { hits as f64 / total as f64 }
        );
    }

    /// Forgets the liveness gathered so far for `region`.
    pub fn clear_statistics_in_region(&self, region: usize) {
        for task in &self.tasks {
            task.lock().clear_mark_stats_cache(region);
        }
        self.stats.clear(region);
    }

    /// Live words found in `region` by the running or last completed cycle.
    pub fn live_words(&self, region: usize) -> usize {
        self.stats.live_words(region)
    }

    pub fn print_stats(&self) {
        if !log::log_enabled!(target: "gc-marking", log::Level::Debug) {
            return;
        }
        for task in &self.tasks {
            task.lock().print_stats();
        }
        let remark = self.remark_times.lock();
        let cleanup = self.cleanup_times.lock();
        log::debug!(
            target: "gc-marking",
            "Remark: {} pauses, avg {:.3}ms, max {:.3}ms; Cleanup: {} pauses, avg {:.3}ms, max {:.3}ms; {} restarts",
            remark.num(),
            remark.avg(),
            remark.maximum(),
            cleanup.num(),
            cleanup.avg(),
            cleanup.maximum(),
            self.restarts()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{
        alloc_region::AllocRegion,
        bytes_to_words,
        object_model::ObjectModel,
        testing::{TestHeap, TestObject},
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::AtomicBool,
    };

    fn marking_options(workers: usize) -> MarkingOptions {
        MarkingOptions {
            parallel_gc_threads: workers,
            conc_gc_threads: workers,
            ..MarkingOptions::default()
        }
    }

    fn add_roots(cm: &ConcurrentMark, test_heap: &TestHeap, roots: &[usize]) {
        cm.root_regions().prepare_for_scan();
        for &root in roots {
            cm.root_regions().add(root, root + test_heap.size_in_bytes(root));
        }
    }

    fn reachable(test_heap: &TestHeap, roots: &[usize]) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = roots.to_vec();
        while let Some(obj) = stack.pop() {
            if obj == 0 || !seen.insert(obj) {
                continue;
            }
            if let Some(object) = test_heap.model.object(obj) {
                stack.extend(object.refs);
            }
        }
        seen
    }

    fn marked(cm: &ConcurrentMark) -> HashSet<usize> {
        let mut marked = HashSet::new();
        cm.prev_bitmap().iterate(cm.heap().table().reserved(), |addr| {
            marked.insert(addr);
            true
        });
        marked
    }

    fn assert_marked_exactly(cm: &ConcurrentMark, test_heap: &TestHeap, expected: &HashSet<usize>) {
        let marked = marked(cm);
        let missing = expected.difference(&marked).count();
        let extra = marked.difference(expected).count();
        assert_eq!((missing, extra), (0, 0), "marked set differs from reachable set");

        let table = cm.heap().table();
        let mut live = HashMap::new();
        for &obj in expected {
            *live.entry(table.addr_to_index(obj)).or_insert(0) += test_heap.model.size_in_words(obj);
        }
        for index in 0..table.len() {
            assert_eq!(
                cm.live_words(index),
                live.get(&index).copied().unwrap_or(0),
                "live words of region {}",
                index
            );
        }
    }

    /// Random object graph over `regions` regions with a few large reference arrays.
    /// Returns the chosen roots.
    fn random_graph(test_heap: &TestHeap, regions: usize, objects: usize, seed: u64) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut all = vec![];
        for _ in 0..objects {
            let words = rng.gen_range(2..16);
            all.push(test_heap.alloc_in(rng.gen_range(0..regions), words, vec![]));
        }

        for &obj in &all {
            let refs = (0..rng.gen_range(0..4))
                .map(|_| {
                    if rng.gen_bool(0.1) {
                        0
                    } else {
                        all[rng.gen_range(0..all.len())]
                    }
                })
                .collect();
            test_heap.set_refs(obj, refs);
        }

        let mut roots = (0..5)
            .map(|_| all[rng.gen_range(0..all.len())])
            .collect::<Vec<_>>();
        for _ in 0..2 {
            let elements = (0..1200).map(|_| all[rng.gen_range(0..all.len())]).collect();
            roots.push(test_heap.alloc_array_in(rng.gen_range(0..regions), elements));
        }
        roots
    }

    #[test]
    fn test_marks_exactly_reachable_objects() {
        for (workers, seed) in [(1, 1), (2, 2), (8, 3)] {
            let test_heap = TestHeap::committed(16, 64 * 1024);
            let roots = random_graph(&test_heap, 16, 3000, seed);
            let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(workers));
            add_roots(&cm, &test_heap, &roots);

            assert!(cm.run_cycle());
            assert_marked_exactly(&cm, &test_heap, &reachable(&test_heap, &roots));
            assert_eq!(cm.phase(), MarkPhase::Idle);
        }
    }

    /// A hub in the last region referencing many objects below it forces pushes that do not
    /// fit into a tiny mark stack.
    fn fan_out_graph(test_heap: &TestHeap, leaves: usize) -> Vec<usize> {
        let mut targets = vec![];
        for i in 0..leaves {
            let child = test_heap.alloc_in(i % 4, 2, vec![]);
            targets.push(test_heap.alloc_in(i % 4, 3, vec![child]));
        }
        let hub = test_heap.alloc_in(7, 4, vec![]);
        let mut refs = targets;
        refs.push(0);
        let array = test_heap.alloc_array_in(6, refs);
        test_heap.set_refs(hub, vec![array]);
        vec![hub]
    }

    fn overflowing_options(workers: usize) -> MarkingOptions {
        MarkingOptions {
            mark_stack_size: 1,
            mark_stack_size_max: 1024,
            entries_per_chunk: 4,
            task_queue_capacity: 4,
            array_slice_stride: 64,
            ..marking_options(workers)
        }
    }

    #[test]
    fn test_overflow_restarts_and_stays_exact() {
        let test_heap = TestHeap::committed(8, 64 * 1024);
        let roots = fan_out_graph(&test_heap, 2000);
        let cm = ConcurrentMark::new(test_heap.heap.clone(), overflowing_options(1));
        add_roots(&cm, &test_heap, &roots);

        assert!(cm.run_cycle());
        assert!(cm.mark_stack().capacity() > 1, "mark stack never overflowed");
        assert_marked_exactly(&cm, &test_heap, &reachable(&test_heap, &roots));
    }

    #[test]
    fn test_parallel_overflow_stays_exact() {
        for workers in [2, 4] {
            let test_heap = TestHeap::committed(8, 64 * 1024);
            let roots = fan_out_graph(&test_heap, 2000);
            let cm = ConcurrentMark::new(test_heap.heap.clone(), overflowing_options(workers));
            add_roots(&cm, &test_heap, &roots);

            assert!(cm.run_cycle());
            assert_marked_exactly(&cm, &test_heap, &reachable(&test_heap, &roots));
        }
    }

    #[test]
    fn test_single_root_region_object() {
        let test_heap = TestHeap::committed(8, 4096);
        let obj = test_heap.alloc_in(3, 8, vec![]);
        test_heap.alloc_in(1, 4, vec![]);
        test_heap.alloc_in(5, 6, vec![]);

        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(4));
        cm.root_regions().prepare_for_scan();
        cm.root_regions().add(obj, obj + 64);
        assert!(cm.run_cycle());

        let marked = marked(&cm);
        assert_eq!(marked.len(), 1);
        assert!(marked.contains(&obj));
        assert_eq!(cm.live_words(3), 8);
        assert_eq!(test_heap.heap.table().at(3).live_words(), 8);
    }

    #[test]
    fn test_satb_logged_objects_are_marked() {
        let test_heap = TestHeap::committed(4, 4096);
        let b = test_heap.alloc_in(0, 2, vec![]);
        let a = test_heap.alloc_in(0, 2, vec![b]);
        let y = test_heap.alloc_in(1, 2, vec![]);
        let x = test_heap.alloc_in(1, 2, vec![y]);

        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(2));
        cm.pre_concurrent_start();
        cm.root_regions().add(a, a + test_heap.size_in_bytes(a));
        cm.scan_root_regions();
        cm.mark_from_roots();
        assert!(cm.next_bitmap().is_marked(b));
        assert!(!cm.next_bitmap().is_marked(x));

        // A mutator overwrote the last reference to `x`.
        cm.satb().enqueue(x);
        cm.preclean();
        cm.remark();
        assert!(!cm.restart_for_overflow());
        assert!(!cm.satb().is_active());
        cm.cleanup();

        let marked = marked(&cm);
        assert_eq!(marked, [a, b, x, y].into_iter().collect::<HashSet<_>>());
        assert_eq!(cm.live_words(1), 4);
    }

    /// Mutators allocate and overwrite references while marking runs. They only stop for the
    /// pauses, as they would at a safepoint.
    #[test]
    fn test_mutators_run_during_marking() {
        const MUTATORS: usize = 3;
        const MAX_MUTATIONS: usize = 3000;

        let test_heap = TestHeap::committed(16, 64 * 1024);
        let roots = random_graph(&test_heap, 8, 2000, 5);
        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(4));
        add_roots(&cm, &test_heap, &roots);

        cm.pre_concurrent_start();
        let snapshot = reachable(&test_heap, &roots);
        let mut targets = snapshot
            .iter()
            .copied()
            .filter(|&obj| test_heap.model.object(obj).map_or(false, |object| !object.is_array))
            .collect::<Vec<_>>();
        targets.sort_unstable();

        let stop = AtomicBool::new(false);
        let mutations = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for mutator in 0..MUTATORS {
                let mine = targets.iter().copied().skip(mutator).step_by(MUTATORS).collect::<Vec<_>>();
                let (test_heap, cm, stop, mutations) = (&test_heap, &cm, &stop, &mutations);
                scope.spawn(move || {
                    let alloc = AllocRegion::new("mutator", test_heap.heap.clone(), 16);
                    let mut rng = StdRng::seed_from_u64(mutator as u64);
                    let mut done = 0;
                    while !stop.load(Ordering::Acquire) {
                        let obj = mine[rng.gen_range(0..mine.len())];
                        let mut refs = test_heap.model.object(obj).map(|object| object.refs).unwrap_or_default();
                        if done >= MAX_MUTATIONS || refs.is_empty() {
                            std::thread::yield_now();
                            continue;
                        }

                        // Pre-write barrier, then store a fresh object holding the old value.
                        let k = rng.gen_range(0..refs.len());
                        let old = refs[k];
                        cm.satb().enqueue(old);
                        let (addr, words) = alloc.allocate(4, 4).expect("heap exhausted");
                        test_heap.model.insert(
                            addr,
                            TestObject {
                                words,
                                refs: vec![old],
                                is_array: false,
                            },
                        );
                        refs[k] = addr;
                        test_heap.set_refs(obj, refs);
                        done += 1;
                        mutations.fetch_add(1, Ordering::Relaxed);
                    }
                    alloc.release();
                });
            }

            cm.scan_root_regions();
            cm.mark_from_roots();
            cm.preclean();
            while mutations.load(Ordering::Relaxed) < 300 {
                std::thread::sleep(Duration::from_millis(1));
            }
            stop.store(true, Ordering::Release);
        });

        cm.remark();
        while cm.restart_for_overflow() {
            cm.mark_from_roots();
            cm.preclean();
            cm.remark();
        }
        cm.cleanup();

        // Everything reachable at the start is marked, and nothing else is.
        assert_marked_exactly(&cm, &test_heap, &snapshot);

        let table = test_heap.heap.table();
        for obj in reachable(&test_heap, &roots) {
            let region = table.region_containing(obj);
            if region.is_below_tams(obj) {
                assert!(cm.prev_bitmap().is_marked(obj), "reachable {:#x} not marked", obj);
            } else {
                assert!(obj < region.top(), "{:#x} outside the allocated part", obj);
            }
        }
        for region in test_heap.heap.regions().active_regions() {
            assert!(
                region.live_words() <= bytes_to_words(region.used()),
                "region {} counts {} live words with {} used",
                region.index(),
                region.live_words(),
                bytes_to_words(region.used())
            );
        }
    }

    #[test]
    fn test_cleanup_reclaims_dead_regions() {
        let test_heap = TestHeap::committed(4, 4096);
        let root = test_heap.alloc_in(2, 4, vec![]);
        test_heap.alloc_in(1, 16, vec![]);
        test_heap.alloc_in(1, 16, vec![root]);
        let free_before = test_heap.heap.regions().num_free_regions();

        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(2));
        add_roots(&cm, &test_heap, &[root]);
        assert!(cm.run_cycle());

        assert_eq!(cm.reclaimed_regions(), 1);
        assert_eq!(test_heap.heap.regions().num_free_regions(), free_before + 1);
        assert!(test_heap.heap.table().at(1).is_empty());
        assert_eq!(test_heap.heap.table().at(2).live_words(), 4);
        assert!(!cm.prev_bitmap().is_marked(test_heap.heap.table().at(1).bottom()));
    }

    #[test]
    fn test_objects_allocated_during_marking_are_live() {
        let test_heap = TestHeap::committed(4, 4096);
        let root = test_heap.alloc_in(0, 4, vec![]);

        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(1));
        add_roots(&cm, &test_heap, &[root]);
        cm.pre_concurrent_start();
        let late = test_heap.alloc_in(0, 6, vec![]);
        cm.scan_root_regions();
        cm.mark_from_roots();
        cm.remark();
        cm.cleanup();

        assert!(!cm.prev_bitmap().is_marked(late));
        assert_eq!(cm.live_words(0), 4);
        assert_eq!(test_heap.heap.table().at(0).live_words(), 10);
    }

    #[test]
    fn test_abort_and_next_cycle() {
        let test_heap = TestHeap::committed(4, 4096);
        let root = test_heap.alloc_in(0, 4, vec![]);
        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(2));

        cm.pre_concurrent_start();
        cm.root_regions().add(root, root + test_heap.size_in_bytes(root));
        cm.concurrent_cycle_abort();
        assert!(cm.has_aborted());
        assert_eq!(cm.root_regions().claim_next(), None);
        assert!(!cm.root_regions().wait_until_scan_finished());
        assert!(!cm.satb().is_active());

        cm.mark_from_roots();
        cm.remark();
        cm.cleanup();
        assert!(cm.next_bitmap().is_clear());

        add_roots(&cm, &test_heap, &[root]);
        assert!(cm.run_cycle());
        assert!(!cm.has_aborted());
        assert!(cm.prev_bitmap().is_marked(root));
    }

    #[test]
    fn test_sub_millisecond_step_budget() {
        let test_heap = TestHeap::committed(8, 64 * 1024);
        let roots = random_graph(&test_heap, 8, 1000, 11);
        let options = MarkingOptions {
            marking_step_ms: 0.5,
            ..marking_options(2)
        };
        let cm = ConcurrentMark::new(test_heap.heap.clone(), options);
        assert_eq!(cm.options().marking_step_ms, 1.0);
        add_roots(&cm, &test_heap, &roots);

        assert!(cm.run_cycle());
        assert_marked_exactly(&cm, &test_heap, &reachable(&test_heap, &roots));
    }

    #[test]
    fn test_aborted_cycle_roots_do_not_leak() {
        let test_heap = TestHeap::committed(4, 4096);
        let stale = test_heap.alloc_in(0, 4, vec![]);
        let root = test_heap.alloc_in(1, 4, vec![]);
        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(2));

        cm.pre_concurrent_start();
        cm.root_regions().add(stale, stale + test_heap.size_in_bytes(stale));
        cm.concurrent_cycle_abort();
        assert_eq!(cm.root_regions().num_root_regions(), 0);

        add_roots(&cm, &test_heap, &[root]);
        assert_eq!(cm.root_regions().num_root_regions(), 1);
        assert!(cm.run_cycle());
        assert!(cm.prev_bitmap().is_marked(root));
        assert!(!cm.prev_bitmap().is_marked(stale));
        assert_eq!(cm.live_words(0), 0);
    }

    #[test]
    fn test_yield_pauses_marking() {
        let test_heap = TestHeap::committed(16, 64 * 1024);
        let roots = random_graph(&test_heap, 16, 3000, 7);
        let cm = Arc::new(ConcurrentMark::new(test_heap.heap.clone(), marking_options(4)));
        add_roots(&cm, &test_heap, &roots);

        cm.request_yield();
        let handle = {
            let cm = cm.clone();
            std::thread::spawn(move || cm.run_cycle())
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(cm.yield_requested());
        cm.clear_yield();

        assert!(handle.join().unwrap());
        assert_marked_exactly(&cm, &test_heap, &reachable(&test_heap, &roots));
    }

    #[test]
    fn test_claim_region_skips_empty_regions() {
        let test_heap = TestHeap::committed(4, 4096);
        test_heap.alloc_in(2, 4, vec![]);
        let cm = ConcurrentMark::new(test_heap.heap.clone(), marking_options(1));
        assert!(cm.out_of_regions());

        cm.pre_concurrent_start();
        assert!(!cm.out_of_regions());
        let mut claimed = vec![];
        while !cm.out_of_regions() {
            if let Some(region) = cm.claim_region(0) {
                claimed.push(region.index());
            }
        }
        assert_eq!(claimed, vec![2]);
        cm.concurrent_cycle_abort();
    }
}
