use std::time::Duration;

use crate::sync::monitor::Monitor;

/// Lets a task waiting for termination leave early, for example because new work showed up
/// or marking was aborted.
pub trait TerminatorTerminator {
    fn should_exit_termination(&mut self) -> bool;
}

struct TerminationState {
    n_threads: usize,
    offered: usize,
}

/// Cooperative termination protocol for a fixed group of tasks.
///
/// A task out of work offers termination and waits. It leaves the wait either because every
/// task offered (termination, returns `true`) or because its [`TerminatorTerminator`] reports
/// a reason to continue, in which case it withdraws its offer and returns `false`. Once all
/// tasks have offered, no offer can be withdrawn any more.
pub struct TaskTerminator {
    state: Monitor<TerminationState>,
    spin: Duration,
}

impl TaskTerminator {
    pub fn new(n_threads: usize, spin: Duration) -> Self {
        Self {
            state: Monitor::new(TerminationState {
                n_threads,
                offered: 0,
            }),
            spin,
        }
    }

    pub fn n_threads(&self) -> usize {
        self.state.lock().n_threads
    }

    /// Prepares the terminator for another round with `n_threads` participants. Every task of
    /// the previous round must have returned from `offer_termination`.
    pub fn reset_for_reuse(&self, n_threads: usize) {
        let mut state = self.state.lock();
        debug_assert!(
            state.offered == 0 || state.offered == state.n_threads,
            "terminator reused while {} of {} tasks are waiting",
            state.offered,
            state.n_threads
        );
        state.offered = 0;
        state.n_threads = n_threads;
    }

    pub fn offer_termination(&self, terminator: &mut dyn TerminatorTerminator) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.offered < state.n_threads);

        if state.n_threads == 1 {
            state.offered = 1;
            return true;
        }

        state.offered += 1;
        if state.offered == state.n_threads {
            log::trace!(target: "gc-marking", "All {} tasks offered termination", state.n_threads);
            state.notify_all();
            return true;
        }

        loop {
            let exit = state.unlocked(|| terminator.should_exit_termination());
            if state.offered == state.n_threads {
                return true;
            }
            if exit {
                state.offered -= 1;
                return false;
            }

            state.wait_timeout(self.spin);
            if state.offered == state.n_threads {
                return true;
            }
        }
    }
}
