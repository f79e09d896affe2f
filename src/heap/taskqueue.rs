use core::fmt;

use crossbeam_deque::{Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;

/// Unit of marking work.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEntry {
    /// A marked object whose references still have to be scanned.
    Obj(usize),
    /// The part of a reference array starting at element `from`. Large arrays are scanned
    /// in strides so that one array cannot pin a task for long.
    ArraySlice { array: usize, from: usize },
}

impl TaskEntry {
    /// The object this entry refers to.
    pub fn obj(&self) -> usize {
        match *self {
            TaskEntry::Obj(obj) => obj,
            TaskEntry::ArraySlice { array, .. } => array,
        }
    }

    pub fn is_array_slice(&self) -> bool {
        matches!(self, TaskEntry::ArraySlice { .. })
    }
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEntry::Obj(obj) => write!(f, "Obj({:#x})", obj),
            TaskEntry::ArraySlice { array, from } => write!(f, "ArraySlice({:#x}, {})", array, from),
        }
    }
}

/// Bounded work-stealing deque owned by one marking task.
///
/// The owner pushes and pops at the LIFO end, other tasks steal through the
/// [`Stealer`] handed out by [`TaskQueue::stealer`].
pub struct TaskQueue {
    worker: Worker<TaskEntry>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            worker: Worker::new_lifo(),
            capacity,
        }
    }

    pub fn stealer(&self) -> Stealer<TaskEntry> {
        self.worker.stealer()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.worker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    /// Returns `false` without pushing when the queue is full.
    #[inline]
    pub fn push(&self, entry: TaskEntry) -> bool {
        if self.worker.len() >= self.capacity {
            return false;
        }
        self.worker.push(entry);
        true
    }

    #[inline]
    pub fn pop(&self) -> Option<TaskEntry> {
        self.worker.pop()
    }

    pub fn clear(&self) {
        while self.worker.pop().is_some() {}
    }
}

/// Steal handles of every task's queue, indexed by task id.
pub struct TaskQueueSet {
    stealers: Vec<Stealer<TaskEntry>>,
}

impl TaskQueueSet {
    pub fn new(stealers: Vec<Stealer<TaskEntry>>) -> Self {
        Self { stealers }
    }

    pub fn len(&self) -> usize {
        self.stealers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stealers.is_empty()
    }

    pub fn stealer(&self, id: usize) -> &Stealer<TaskEntry> {
        &self.stealers[id]
    }

    /// Whether every queue among the first `active` ones, other than `task_id`'s, is empty.
    pub fn peers_empty(&self, task_id: usize, active: usize) -> bool {
        self.stealers
            .iter()
            .take(active)
            .enumerate()
            .all(|(id, stealer)| id == task_id || stealer.is_empty())
    }

    /// Tries to steal from randomly chosen victims among the first `active` queues. Stolen
    /// batches land in `queue`, one entry is returned.
    pub fn steal(&self, task_id: usize, active: usize, queue: &TaskQueue) -> Option<TaskEntry> {
        let active = active.min(self.stealers.len());
        if active <= 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, active);

        for _ in 0..2 * active {
            let mut victim = task_id;
            while victim == task_id {
                victim = range.sample(&mut rng);
            }

            loop {
                match self.stealers[victim].steal_batch_and_pop(&queue.worker) {
                    Steal::Empty => break,
                    Steal::Success(entry) => return Some(entry),
                    Steal::Retry => continue,
                }
            }
        }

        // Random probing can miss the last non-empty queue.
        for (victim, stealer) in self.stealers.iter().take(active).enumerate() {
            if victim == task_id {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Empty => break,
                    Steal::Success(entry) => return Some(entry),
                    Steal::Retry => continue,
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_push() {
        let queue = TaskQueue::new(2);
        assert!(queue.push(TaskEntry::Obj(8)));
        assert!(queue.push(TaskEntry::ArraySlice { array: 16, from: 512 }));
        assert!(!queue.push(TaskEntry::Obj(24)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(TaskEntry::ArraySlice { array: 16, from: 512 }));
        assert_eq!(queue.pop().map(|e| e.obj()), Some(8));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_steal_from_peer() {
        let queues = (0..3).map(|_| TaskQueue::new(16)).collect::<Vec<_>>();
        let set = TaskQueueSet::new(queues.iter().map(|q| q.stealer()).collect());

        for i in 1..=4 {
            queues[2].push(TaskEntry::Obj(i * 8));
        }
        assert!(!set.peers_empty(0, 3));
        assert!(set.peers_empty(2, 3));
        assert!(set.peers_empty(0, 2));

        let mut stolen = vec![];
        while let Some(entry) = set.steal(0, 3, &queues[0]) {
            stolen.push(entry.obj());
            while let Some(entry) = queues[0].pop() {
                stolen.push(entry.obj());
            }
        }
        stolen.sort();
        assert_eq!(stolen, vec![8, 16, 24, 32]);
        assert!(set.peers_empty(0, 3));
        assert_eq!(set.steal(0, 1, &queues[0]), None);
    }
}
