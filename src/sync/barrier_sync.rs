use super::monitor::Monitor;

struct BarrierState {
    n_workers: usize,
    n_completed: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable rendezvous for a fixed number of workers that can be aborted.
///
/// Once aborted, every current and future `enter` returns `false` until the barrier is
/// re-armed with [`WorkerBarrierSync::set_n_workers`].
pub struct WorkerBarrierSync {
    monitor: Monitor<BarrierState>,
}

impl WorkerBarrierSync {
    pub fn new(n_workers: usize) -> Self {
        Self {
            monitor: Monitor::new(BarrierState {
                n_workers,
                n_completed: 0,
                generation: 0,
                aborted: false,
            }),
        }
    }

    pub fn set_n_workers(&self, n_workers: usize) {
        let mut ml = self.monitor.lock();
        ml.n_workers = n_workers;
        ml.n_completed = 0;
        ml.aborted = false;
        ml.generation = ml.generation.wrapping_add(1);
        ml.notify_all();
    }

    pub fn n_workers(&self) -> usize {
        self.monitor.lock().n_workers
    }

    /// Blocks until all workers have entered. Returns `false` if the barrier was aborted.
    pub fn enter(&self) -> bool {
        let mut ml = self.monitor.lock();
        if ml.aborted {
            return false;
        }

        ml.n_completed += 1;
        if ml.n_completed == ml.n_workers {
            ml.n_completed = 0;
            ml.generation = ml.generation.wrapping_add(1);
            ml.notify_all();
            return true;
        }

        let generation = ml.generation;
        ml.wait_while(|state| state.generation == generation && !state.aborted);
        !ml.aborted
    }

    pub fn abort(&self) {
        let mut ml = self.monitor.lock();
        ml.aborted = true;
        ml.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.monitor.lock().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerBarrierSync;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_rendezvous_is_reusable() {
        let barrier = Arc::new(WorkerBarrierSync::new(4));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for round in 1..=3 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        assert!(barrier.enter());
                        assert!(counter.load(Ordering::SeqCst) >= round * 4);
                        assert!(barrier.enter());
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_abort_releases_waiters() {
        let barrier = Arc::new(WorkerBarrierSync::new(3));
        let waiter = {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.enter())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        barrier.abort();
        assert!(!waiter.join().unwrap());
        assert!(!barrier.enter());

        barrier.set_n_workers(1);
        assert!(barrier.enter());
    }
}
