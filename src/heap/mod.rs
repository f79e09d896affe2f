use std::{fmt, mem::size_of, time::Instant};

pub mod alloc_region;
pub mod committed_region_map;
pub mod concurrent_mark;
pub mod heap;
pub mod mark_bitmap;
pub mod mark_stack;
pub mod marking_task;
pub mod object_model;
pub mod options;
pub mod region;
pub mod region_manager;
pub mod region_mark_stats;
pub mod region_table;
pub mod root_regions;
pub mod satb_mark_queue;
pub mod shared_vars;
pub mod taskqueue;
pub mod terminator;
pub mod virtual_memory;

#[cfg(test)]
pub mod testing;

/// Size of a heap word in bytes. Allocation sizes and liveness are counted in words.
pub const HEAP_WORD_SIZE: usize = size_of::<usize>();
pub const LOG_HEAP_WORD_SIZE: usize = HEAP_WORD_SIZE.trailing_zeros() as usize;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align).wrapping_sub(1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

#[inline(always)]
pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_HEAP_WORD_SIZE
}

#[inline(always)]
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes >> LOG_HEAP_WORD_SIZE
}

/// Half-open address range `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemRegion {
    start: usize,
    end: usize,
}

impl MemRegion {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn with_words(start: usize, words: usize) -> Self {
        Self {
            start,
            end: start + words_to_bytes(words),
        }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn end(&self) -> usize {
        self.end
    }

    pub const fn byte_size(&self) -> usize {
        self.end - self.start
    }

    pub const fn word_size(&self) -> usize {
        bytes_to_words(self.byte_size())
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn intersection(&self, other: &MemRegion) -> MemRegion {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            MemRegion::new(start, end)
        } else {
            MemRegion::default()
        }
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

impl fmt::Display for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Logs the duration of a concurrent phase when dropped.
pub struct ConcurrentPhase {
    name: &'static str,
    cycle: usize,
    start: Instant,
}

impl ConcurrentPhase {
    pub fn new(name: &'static str, cycle: usize) -> Self {
        log::debug!(target: "gc", "GC({}) Concurrent {}", cycle, name);
        Self {
            name,
            cycle,
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Concurrent {} {}ms", self.cycle, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

/// Logs the duration of a pause when dropped.
pub struct PausePhase {
    name: &'static str,
    cycle: usize,
    start: Instant,
}

impl PausePhase {
    pub fn new(name: &'static str, cycle: usize) -> Self {
        Self {
            name,
            cycle,
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {}ms", self.cycle, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}
