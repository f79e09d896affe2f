use core::fmt;
use std::mem::size_of;

use crate::utils::{
    env::{read_float_from_env, read_uint_from_env},
    formatted_size,
};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct HeapOptions {
    pub region_size_bytes: usize,
    pub region_size_words: usize,
    pub region_size_bytes_shift: usize,
    pub region_size_bytes_mask: usize,
    pub region_size_words_shift: usize,
    pub region_count: usize,
    pub max_heap_size: usize,
}

impl HeapOptions {
    pub const MIN_REGION_SIZE: usize = 4 * 1024;
    pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;
    pub const TARGET_NUM_REGIONS: usize = 2048;

    /// Computes region geometry for a heap of `max_heap_size` bytes.
    ///
    /// The region size is rounded to a power of two between [`Self::MIN_REGION_SIZE`] and
    /// [`Self::MAX_REGION_SIZE`], and the heap size is rounded up to a whole number of regions.
    pub fn setup_sizes(max_heap_size: usize, region_size: Option<usize>) -> Self {
        let mut region_size = region_size
            .unwrap_or(max_heap_size / Self::TARGET_NUM_REGIONS)
            .clamp(Self::MIN_REGION_SIZE, Self::MAX_REGION_SIZE);

        if !region_size.is_power_of_two() {
            let rounded = region_size.next_power_of_two().min(Self::MAX_REGION_SIZE);
            log::warn!(target: "gc", "Region size {} is not a power of two, using {}", formatted_size(region_size), formatted_size(rounded));
            region_size = rounded;
        }

        let mut max_heap_size = super::align_up(max_heap_size, region_size);
        if max_heap_size == 0 {
            log::warn!(target: "gc", "Heap size is zero, using a single region");
            max_heap_size = region_size;
        }

        let shift = region_size.trailing_zeros() as usize;
        let opts = Self {
            region_size_bytes: region_size,
            region_size_words: region_size / size_of::<usize>(),
            region_size_bytes_shift: shift,
            region_size_bytes_mask: region_size - 1,
            region_size_words_shift: shift - super::LOG_HEAP_WORD_SIZE,
            region_count: max_heap_size >> shift,
            max_heap_size,
        };

        log::info!(target: "gc", "Heap regions:");
        log::info!(target: "gc", "- Region count: {}", opts.region_count);
        log::info!(target: "gc", "- Region size: {}", formatted_size(opts.region_size_bytes));
        log::info!(target: "gc", "- Max heap size: {}", formatted_size(opts.max_heap_size));
        opts
    }

    /// Reads `CONCMARK_MAX_HEAP_SIZE` (default 256M) and `CONCMARK_REGION_SIZE`.
    pub fn from_env() -> Self {
        let max_heap_size =
            read_uint_from_env("CONCMARK_MAX_HEAP_SIZE").unwrap_or(256 * 1024 * 1024);
        let region_size = read_uint_from_env("CONCMARK_REGION_SIZE");
        Self::setup_sizes(max_heap_size, region_size)
    }

    pub const fn required_regions(&self, size: usize) -> usize {
        (size + self.region_size_bytes - 1) >> self.region_size_bytes_shift
    }
}

impl fmt::Display for HeapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapOptions")
            .field("region_size_bytes", &formatted_size(self.region_size_bytes))
            .field("region_size_words", &self.region_size_words)
            .field("region_size_bytes_shift", &self.region_size_bytes_shift)
            .field("region_count", &self.region_count)
            .field("max_heap_size", &formatted_size(self.max_heap_size))
            .finish()
    }
}

/// Tuning knobs of the marking engine.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkingOptions {
    /// Workers used during pauses (remark).
    pub parallel_gc_threads: usize,
    /// Workers used for concurrent phases.
    pub conc_gc_threads: usize,
    /// Initial overflow stack capacity, in chunks.
    pub mark_stack_size: usize,
    /// Hard limit on overflow stack capacity, in chunks.
    pub mark_stack_size_max: usize,
    pub entries_per_chunk: usize,
    /// Capacity of each worker's local queue.
    pub task_queue_capacity: usize,
    pub drain_stack_target_size: usize,
    pub words_scanned_period: usize,
    pub refs_reached_period: usize,
    /// Number of array elements scanned per slice before a continuation is pushed.
    pub array_slice_stride: usize,
    /// Entries in each worker's liveness cache. Must be a power of two.
    pub stats_cache_size: usize,
    pub satb_buffer_size: usize,
    /// Completed SATB buffers needed before workers are asked to drain them.
    pub satb_process_threshold: usize,
    /// Target duration of a concurrent marking step.
    pub marking_step_ms: f64,
    pub alloc_cas_retries: usize,
    /// How long a worker offering termination sleeps between checks for new work.
    pub termination_spin_us: u64,
}

impl Default for MarkingOptions {
    fn default() -> Self {
        let parallel_gc_threads = num_cpus::get().max(1);
        Self {
            parallel_gc_threads,
            conc_gc_threads: ((parallel_gc_threads + 2) / 4).max(1),
            mark_stack_size: 32,
            mark_stack_size_max: 4096,
            entries_per_chunk: 1024 - 1,
            task_queue_capacity: 1 << 14,
            drain_stack_target_size: 64,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 1024,
            array_slice_stride: 512,
            stats_cache_size: 1024,
            satb_buffer_size: 1024,
            satb_process_threshold: 20,
            marking_step_ms: 10.0,
            alloc_cas_retries: 64,
            termination_spin_us: 50,
        }
    }
}

impl MarkingOptions {
    /// Defaults overridden by `CONCMARK_*` environment variables.
    pub fn from_env() -> Self {
        let mut opts = Self::default();

        macro_rules! env_uint {
            ($($field: ident => $var: literal),*) => {
                $(
                    if let Some(value) = read_uint_from_env($var) {
                        opts.$field = value as _;
                    }
                )*
            };
        }

        env_uint! {
            parallel_gc_threads => "CONCMARK_PARALLEL_GC_THREADS",
            conc_gc_threads => "CONCMARK_CONC_GC_THREADS",
            mark_stack_size => "CONCMARK_MARK_STACK_SIZE",
            mark_stack_size_max => "CONCMARK_MARK_STACK_SIZE_MAX",
            entries_per_chunk => "CONCMARK_ENTRIES_PER_CHUNK",
            task_queue_capacity => "CONCMARK_TASK_QUEUE_CAPACITY",
            drain_stack_target_size => "CONCMARK_DRAIN_STACK_TARGET_SIZE",
            words_scanned_period => "CONCMARK_WORDS_SCANNED_PERIOD",
            refs_reached_period => "CONCMARK_REFS_REACHED_PERIOD",
            array_slice_stride => "CONCMARK_ARRAY_SLICE_STRIDE",
            stats_cache_size => "CONCMARK_STATS_CACHE_SIZE",
            satb_buffer_size => "CONCMARK_SATB_BUFFER_SIZE",
            satb_process_threshold => "CONCMARK_SATB_PROCESS_THRESHOLD",
            alloc_cas_retries => "CONCMARK_ALLOC_CAS_RETRIES",
            termination_spin_us => "CONCMARK_TERMINATION_SPIN_US"
        }

        if let Some(ms) = read_float_from_env("CONCMARK_MARKING_STEP_MS") {
            opts.marking_step_ms = ms;
        }

        opts.sanitize();
        opts
    }

    /// Clamps values that would break the engine, logging each adjustment.
    pub fn sanitize(&mut self) {
        fn at_least(name: &str, value: &mut usize, min: usize) {
            if *value < min {
                log::warn!(target: "gc", "{} = {} is too small, using {}", name, value, min);
                *value = min;
            }
        }

        at_least("parallel_gc_threads", &mut self.parallel_gc_threads, 1);
        at_least("conc_gc_threads", &mut self.conc_gc_threads, 1);
        if self.conc_gc_threads > self.parallel_gc_threads {
            log::warn!(target: "gc", "conc_gc_threads ({}) exceeds parallel_gc_threads ({}), clamping", self.conc_gc_threads, self.parallel_gc_threads);
            self.conc_gc_threads = self.parallel_gc_threads;
        }
        at_least("mark_stack_size", &mut self.mark_stack_size, 1);
        let min_max = self.mark_stack_size;
        at_least("mark_stack_size_max", &mut self.mark_stack_size_max, min_max);
        at_least("entries_per_chunk", &mut self.entries_per_chunk, 1);
        at_least("task_queue_capacity", &mut self.task_queue_capacity, 2);
        at_least("drain_stack_target_size", &mut self.drain_stack_target_size, 1);
        at_least("words_scanned_period", &mut self.words_scanned_period, 1);
        at_least("refs_reached_period", &mut self.refs_reached_period, 1);
        at_least("array_slice_stride", &mut self.array_slice_stride, 1);
        at_least("satb_buffer_size", &mut self.satb_buffer_size, 1);
        at_least("alloc_cas_retries", &mut self.alloc_cas_retries, 1);

        if !self.stats_cache_size.is_power_of_two() {
            let rounded = self.stats_cache_size.max(1).next_power_of_two();
            log::warn!(target: "gc", "stats_cache_size = {} is not a power of two, using {}", self.stats_cache_size, rounded);
            self.stats_cache_size = rounded;
        }
        if !(self.marking_step_ms > 0.0) {
            log::warn!(target: "gc", "marking_step_ms = {} is not positive, using 10ms", self.marking_step_ms);
            self.marking_step_ms = 10.0;
        } else if self.marking_step_ms < 1.0 {
            log::warn!(target: "gc", "marking_step_ms = {} is below the 1ms granularity, using 1ms", self.marking_step_ms);
            self.marking_step_ms = 1.0;
        }
    }

    /// The largest number of workers any phase may use.
    pub fn max_workers(&self) -> usize {
        self.parallel_gc_threads.max(self.conc_gc_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_sizes() {
        let opts = HeapOptions::setup_sizes(64 * 1024 * 1024, None);
        assert!(opts.region_size_bytes.is_power_of_two());
        assert_eq!(opts.region_count * opts.region_size_bytes, opts.max_heap_size);
        assert_eq!(1 << opts.region_size_bytes_shift, opts.region_size_bytes);

        let opts = HeapOptions::setup_sizes(100 * 1024, Some(6000));
        assert_eq!(opts.region_size_bytes, 8192);
        assert_eq!(opts.max_heap_size, 104 * 1024);
        assert_eq!(opts.region_count, 13);
        assert_eq!(opts.required_regions(8193), 2);
    }

    #[test]
    fn test_sanitize() {
        let mut opts = MarkingOptions {
            parallel_gc_threads: 0,
            conc_gc_threads: 8,
            mark_stack_size: 16,
            mark_stack_size_max: 4,
            stats_cache_size: 100,
            marking_step_ms: -1.0,
            ..MarkingOptions::default()
        };
        opts.sanitize();
        assert_eq!(opts.parallel_gc_threads, 1);
        assert_eq!(opts.conc_gc_threads, 1);
        assert_eq!(opts.mark_stack_size_max, 16);
        assert_eq!(opts.stats_cache_size, 128);
        assert_eq!(opts.marking_step_ms, 10.0);

        let mut opts = MarkingOptions {
            marking_step_ms: 0.5,
            ..MarkingOptions::default()
        };
        opts.sanitize();
        assert_eq!(opts.marking_step_ms, 1.0);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("CONCMARK_ENTRIES_PER_CHUNK", "127");
        std::env::set_var("CONCMARK_MARKING_STEP_MS", "2.5");
        let opts = MarkingOptions::from_env();
        assert_eq!(opts.entries_per_chunk, 127);
        assert_eq!(opts.marking_step_ms, 2.5);
        std::env::remove_var("CONCMARK_ENTRIES_PER_CHUNK");
        std::env::remove_var("CONCMARK_MARKING_STEP_MS");
    }
}
