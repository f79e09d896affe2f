//! Snapshot-at-the-beginning logging.
//!
//! While marking is active, mutators record the previous value of every reference they
//! overwrite. Each thread fills its own buffer; full buffers move to a shared completed list
//! that marking tasks drain.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use thread_local::ThreadLocal;

use super::shared_vars::SharedFlag;

/// Where marking tasks get logged references from.
pub trait SatbBufferSource: Send + Sync {
    /// Takes one completed buffer off the shared list.
    fn drain_next_buffer(&self) -> Option<Vec<usize>>;

    fn completed_buffers_num(&self) -> usize;

    /// Whether enough completed buffers piled up that tasks should stop and drain them.
    fn process_completed_buffers(&self) -> bool;
}

pub struct SatbMarkQueue {
    buf: Vec<usize>,
    capacity: usize,
}

impl SatbMarkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the buffer once it is full.
    fn enqueue(&mut self, obj: usize) -> Option<Vec<usize>> {
        self.buf.push(obj);
        if self.buf.len() >= self.capacity {
            Some(std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity)))
        } else {
            None
        }
    }

    fn take(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.buf)
    }
}

pub struct SatbMarkQueueSet {
    queues: ThreadLocal<Mutex<SatbMarkQueue>>,
    completed: SegQueue<Vec<usize>>,
    num_completed: AtomicUsize,
    buffer_size: usize,
    process_threshold: usize,
    process_completed: SharedFlag,
    active: SharedFlag,
}

impl SatbMarkQueueSet {
    pub fn new(buffer_size: usize, process_threshold: usize) -> Self {
        Self {
            queues: ThreadLocal::new(),
            completed: SegQueue::new(),
            num_completed: AtomicUsize::new(0),
            buffer_size,
            process_threshold,
            process_completed: SharedFlag::new(),
            active: SharedFlag::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_set()
    }

    pub fn set_active(&self, active: bool) {
        log::trace!(target: "gc-satb", "SATB logging {}", if active { "on" } else { "off" });
        self.active.set_cond(active);
    }

    /// Logs `obj` for the calling thread. A no-op while marking is not active.
    pub fn enqueue(&self, obj: usize) {
        if !self.is_active() || obj == 0 {
            return;
        }

        let full = self
            .queues
            .get_or(|| Mutex::new(SatbMarkQueue::new(self.buffer_size)))
            .lock()
            .enqueue(obj);
        if let Some(buffer) = full {
            self.enqueue_completed_buffer(buffer);
        }
    }

    pub fn enqueue_completed_buffer(&self, buffer: Vec<usize>) {
        if buffer.is_empty() {
            return;
        }
        // Counted before it becomes visible, so a consumer never pops an uncounted buffer.
        let num = self.num_completed.fetch_add(1, Ordering::AcqRel) + 1;
        self.completed.push(buffer);
        if num > self.process_threshold {
            self.process_completed.set();
        }
    }

    /// Moves every thread's partial buffer to the completed list, keeping only entries for
    /// which `retain` returns `true`.
    pub fn flush_all_queues(&self, mut retain: impl FnMut(usize) -> bool) {
        let mut flushed = 0;
        for queue in self.queues.iter() {
            let mut buffer = queue.lock().take();
            buffer.retain(|&obj| retain(obj));
            if !buffer.is_empty() {
                flushed += 1;
                self.enqueue_completed_buffer(buffer);
            }
        }
        log::trace!(target: "gc-satb", "Flushed {} thread buffers, {} completed", flushed, self.completed_buffers_num());
    }

    /// Drops all logged entries, partial and completed.
    pub fn abandon_partial_marking(&self) {
        for queue in self.queues.iter() {
            queue.lock().take();
        }
        while self.completed.pop().is_some() {}
        self.num_completed.store(0, Ordering::Release);
        self.process_completed.unset();
    }
}

impl SatbBufferSource for SatbMarkQueueSet {
    fn drain_next_buffer(&self) -> Option<Vec<usize>> {
        let buffer = self.completed.pop()?;
        let num = self
            .num_completed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(0, |n| n.saturating_sub(1));
        if num <= self.process_threshold {
            self.process_completed.unset();
        }
        Some(buffer)
    }

    fn completed_buffers_num(&self) -> usize {
        self.num_completed.load(Ordering::Acquire)
    }

    fn process_completed_buffers(&self) -> bool {
        self.process_completed.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{atomic::AtomicBool, Arc, Barrier},
        time::Duration,
    };

    #[test]
    fn test_inactive_queue_logs_nothing() {
        let set = SatbMarkQueueSet::new(4, 1);
        set.enqueue(0x1000);
        set.flush_all_queues(|_| true);
        assert_eq!(set.completed_buffers_num(), 0);
    }

    #[test]
    fn test_buffers_from_all_threads_are_drained() {
        let set = Arc::new(SatbMarkQueueSet::new(4, 2));
        set.set_active(true);

        // Threads stay alive until all have logged, so none inherits another's buffer.
        let barrier = Arc::new(Barrier::new(4));
        let handles = (0..4)
            .map(|t| {
                let set = set.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        set.enqueue((t * 100 + i + 1) * 8);
                    }
                    barrier.wait();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        // Two full buffers per thread.
        assert_eq!(set.completed_buffers_num(), 8);
        assert!(set.process_completed_buffers());

        // Odd entries count as already marked.
        set.flush_all_queues(|obj| (obj / 8) % 2 == 0);
        assert_eq!(set.completed_buffers_num(), 12);

        let mut drained = vec![];
        while let Some(buffer) = set.drain_next_buffer() {
            drained.extend(buffer);
        }
        assert!(!set.process_completed_buffers());
        assert_eq!(drained.len(), 4 * 8 + 4);
        assert!(drained.contains(&((100 + 10) * 8)));
    }

    #[test]
    fn test_abandon() {
        let set = SatbMarkQueueSet::new(2, 0);
        set.set_active(true);
        set.enqueue(8);
        set.enqueue(16);
        set.enqueue(24);
        assert!(set.process_completed_buffers());
        set.abandon_partial_marking();
        set.flush_all_queues(|_| true);
        assert_eq!(set.completed_buffers_num(), 0);
        assert!(set.drain_next_buffer().is_none());
    }

    #[test]
    fn test_count_stays_consistent_with_concurrent_drainers() {
        let set = Arc::new(SatbMarkQueueSet::new(4, 2));
        let done = Arc::new(AtomicBool::new(false));
        let produced = 20_000;

        let drainers = (0..6)
            .map(|_| {
                let set = set.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut drained = 0;
                    loop {
                        match set.drain_next_buffer() {
                            Some(buffer) => drained += buffer.len(),
                            None if done.load(Ordering::Acquire) => break,
                            None => std::thread::yield_now(),
                        }
                        assert!(set.completed_buffers_num() <= produced);
                    }
                    drained
                })
            })
            .collect::<Vec<_>>();

        for i in 0..produced {
            set.enqueue_completed_buffer(vec![(i + 1) * 8]);
        }
        std::thread::sleep(Duration::from_millis(10));
        done.store(true, Ordering::Release);

        let mut total = 0;
        for drainer in drainers {
            total += drainer.join().unwrap();
        }
        while let Some(buffer) = set.drain_next_buffer() {
            total += buffer.len();
        }
        assert_eq!(total, produced);
        assert_eq!(set.completed_buffers_num(), 0);
    }
}
