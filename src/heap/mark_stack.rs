//! Global overflow stack for marking work.
//!
//! Entries are moved in chunks of up to `entries_per_chunk` entries. Chunks live in an arena
//! and are threaded through two lock-free lists: the data list of chunks holding work and the
//! free list of chunks that can be reused. Chunks never seen by either list are handed out by
//! bumping a high-water mark.
//!
//! A list head packs the chunk index (plus one, zero meaning empty) with a tag that is bumped
//! on every update, so a head that was popped and pushed back in between is never mistaken
//! for an unchanged one.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use super::taskqueue::TaskEntry;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ListHead {
    data: u64,
}

impl ListHead {
    const EMPTY: Self = Self { data: 0 };

    fn new(index: Option<usize>, tag: u32) -> Self {
        let index = index.map_or(0, |i| i as u64 + 1);
        debug_assert!(index <= u32::MAX as u64);
        Self {
            data: index | ((tag as u64) << 32),
        }
    }

    fn index(self) -> Option<usize> {
        match self.data as u32 {
            0 => None,
            i => Some(i as usize - 1),
        }
    }

    fn tag(self) -> u32 {
        (self.data >> 32) as u32
    }
}

struct Chunk {
    /// Encoded like a list head index: chunk index plus one, zero terminates the list.
    next: AtomicUsize,
    /// Only touched by the thread that currently owns the chunk, which is never more than one.
    entries: Mutex<Vec<TaskEntry>>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }
}

pub struct MarkStack {
    chunks: RwLock<Vec<Chunk>>,
    max_chunks: usize,
    entries_per_chunk: usize,
    hwm: AtomicUsize,
    data_list: AtomicU64,
    free_list: AtomicU64,
    chunks_in_list: AtomicUsize,
}

impl MarkStack {
    /// Stack of `initial_chunks` chunks that can grow up to `max_chunks`.
    pub fn new(initial_chunks: usize, max_chunks: usize, entries_per_chunk: usize) -> Self {
        assert!(initial_chunks > 0 && initial_chunks <= max_chunks);
        assert!(entries_per_chunk > 0);
        log::debug!(
            target: "gc-stack",
            "Mark stack: {} chunks of {} entries (max {} chunks)",
            initial_chunks,
            entries_per_chunk,
            max_chunks
        );
        Self {
            chunks: RwLock::new((0..initial_chunks).map(|_| Chunk::new()).collect()),
            max_chunks,
            entries_per_chunk,
            hwm: AtomicUsize::new(0),
            data_list: AtomicU64::new(ListHead::EMPTY.data),
            free_list: AtomicU64::new(ListHead::EMPTY.data),
            chunks_in_list: AtomicUsize::new(0),
        }
    }

    pub fn entries_per_chunk(&self) -> usize {
        self.entries_per_chunk
    }

    /// Capacity in chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn capacity_entries(&self) -> usize {
        self.capacity() * self.entries_per_chunk
    }

    pub fn max_capacity(&self) -> usize {
        self.max_chunks
    }

    pub fn is_empty(&self) -> bool {
        ListHead {
            data: self.data_list.load(Ordering::Acquire),
        }
        .index()
        .is_none()
    }

    /// Approximate number of entries on the stack.
    pub fn size(&self) -> usize {
        self.chunks_in_list.load(Ordering::Relaxed) * self.entries_per_chunk
    }

    fn push_to_list(chunks: &[Chunk], head: &AtomicU64, index: usize) {
        let mut old = ListHead {
            data: head.load(Ordering::Acquire),
        };
        loop {
            chunks[index]
                .next
                .store(old.index().map_or(0, |i| i + 1), Ordering::Relaxed);
            let new = ListHead::new(Some(index), old.tag().wrapping_add(1));
            match head.compare_exchange_weak(old.data, new.data, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(current) => old = ListHead { data: current },
            }
        }
    }

    fn pop_from_list(chunks: &[Chunk], head: &AtomicU64) -> Option<usize> {
        let mut old = ListHead {
            data: head.load(Ordering::Acquire),
        };
        loop {
            let index = old.index()?;
            // May be stale if another thread popped the chunk meanwhile. The tag then
            // differs and the exchange below fails.
            let next = match chunks[index].next.load(Ordering::Relaxed) {
                0 => None,
                n => Some(n - 1),
            };
            let new = ListHead::new(next, old.tag().wrapping_add(1));
            match head.compare_exchange_weak(old.data, new.data, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(index),
                Err(current) => old = ListHead { data: current },
            }
        }
    }

    fn allocate_new_chunk(&self, capacity: usize) -> Option<usize> {
        // The high-water mark may run past capacity under contention; it is only reset by
        // `set_empty`, so overshooting just reads as "full".
        if self.hwm.load(Ordering::Relaxed) >= capacity {
            return None;
        }
        let index = self.hwm.fetch_add(1, Ordering::Relaxed);
        if index >= capacity {
            return None;
        }
        Some(index)
    }

    /// Pushes `entries` as one chunk. Returns `false` if no chunk is available, in which
    /// case the caller must treat the stack as overflown.
    pub fn par_push_chunk(&self, entries: &[TaskEntry]) -> bool {
        debug_assert!(!entries.is_empty() && entries.len() <= self.entries_per_chunk);
        let chunks = self.chunks.read();

        let index = match Self::pop_from_list(&chunks, &self.free_list) {
            Some(index) => index,
            None => match self.allocate_new_chunk(chunks.len()) {
                Some(index) => index,
                None => {
                    log::trace!(target: "gc-stack", "Mark stack full ({} chunks)", chunks.len());
                    return false;
                }
            },
        };

        {
            let mut data = chunks[index].entries.lock();
            data.clear();
            data.extend_from_slice(entries);
        }

        Self::push_to_list(&chunks, &self.data_list, index);
        self.chunks_in_list.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Moves the entries of one chunk to the end of `buffer`. Returns `false` if the stack
    /// was empty.
    pub fn par_pop_chunk(&self, buffer: &mut Vec<TaskEntry>) -> bool {
        let chunks = self.chunks.read();
        let index = match Self::pop_from_list(&chunks, &self.data_list) {
            Some(index) => index,
            None => return false,
        };
        self.chunks_in_list.fetch_sub(1, Ordering::Relaxed);

        buffer.extend(chunks[index].entries.lock().drain(..));
        Self::push_to_list(&chunks, &self.free_list, index);
        true
    }

    /// Forgets all content. Only valid while no other thread uses the stack.
    pub fn set_empty(&self) {
        self.chunks_in_list.store(0, Ordering::Relaxed);
        self.data_list.store(ListHead::EMPTY.data, Ordering::Release);
        self.free_list.store(ListHead::EMPTY.data, Ordering::Release);
        self.hwm.store(0, Ordering::Relaxed);
    }

    /// Doubles the capacity, up to the maximum. Only valid while the stack is empty and
    /// not in use. Returns whether the capacity changed.
    pub fn expand(&self) -> bool {
        let mut chunks = self.chunks.write();
        assert!(self.is_empty(), "expanding a non-empty mark stack");

        let old_capacity = chunks.len();
        if old_capacity == self.max_chunks {
            log::debug!(
                target: "gc-stack",
                "Can not expand overflow mark stack further, already at maximum capacity of {} chunks",
                self.max_chunks
            );
            return false;
        }

        let new_capacity = (old_capacity * 2).min(self.max_chunks);
        chunks.resize_with(new_capacity, Chunk::new);
        self.set_empty();
        log::info!(
            target: "gc-stack",
            "Expanded mark stack capacity from {} to {} chunks",
            old_capacity,
            new_capacity
        );
        true
    }
}
