//! A reusable two-stage barrier between one controller and a group of workers.
//!
//! The controller drives the phases:
//!
//! ```txt
//! controller: phase_end ....................... phase_begin  phase_end ...
//! workers:              start [phase work] end               start ...
//! ```
//!
//! [`PhaseSynchronizer::phase_end`] releases the workers into the next phase and returns
//! immediately. Every worker waits in [`WorkerPhase::start`] until that happens, does the work of
//! the phase concurrently with the other workers, and signals with [`WorkerPhase::end`], which
//! blocks until the controller has collected the phase with [`PhaseSynchronizer::phase_begin`].
//! Anything the controller does between `phase_begin` and the following `phase_end` is therefore
//! never concurrent with worker phase work.
//!
//! Phases are numbered with a generation counter. A worker remembers the last generation it has
//! run and ignores wake-ups that do not advance it.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct PhaseState {
    /// Number of workers that must arrive before a phase can be collected.
    workers: usize,
    /// Number of workers that have ended the current generation.
    arrived: usize,
    /// Generation of the last released phase.
    generation: u64,
    /// Generation of the last collected phase.
    collected: u64,
}

#[derive(Debug)]
pub struct PhaseSynchronizer {
    state: Mutex<PhaseState>,
    cond: Condvar,
    interrupted: AtomicBool,
}

impl Default for PhaseSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseSynchronizer {
    pub fn new() -> Self {
        let state = PhaseState {
            workers: 0,
            arrived: 0,
            generation: 0,
            collected: 0,
        };
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Fix how many workers take part in the next phase. Must be called between a
    /// [`Self::phase_begin`] and the next [`Self::phase_end`].
    pub fn set_worker_count(&self, workers: usize) {
        self.state.lock().workers = workers;
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers
    }

    /// The generation of the last released phase.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Register a new worker. It will take part starting from the next released phase.
    pub fn worker(self: &Arc<Self>) -> WorkerPhase {
        let seen = self.state.lock().generation;
        WorkerPhase {
            sync: self.clone(),
            seen,
        }
    }

    /// Wait until every worker has ended the released phase, then collect it. Returns
    /// immediately if no phase is outstanding.
    ///
    /// Fails with [`Error::Interrupted`] if [`Self::interrupt`] is called while waiting; the
    /// phase is then left uncollected.
    pub fn phase_begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.generation > state.collected && state.arrived < state.workers {
            if self.interrupted.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            self.cond.wait(&mut state);
        }
        self.collect(&mut state);
        Ok(())
    }

    /// Same as [`Self::phase_begin`], but ignores interrupts. Used to drain workers when a run
    /// is being aborted.
    pub fn phase_begin_uninterruptible(&self) {
        let mut state = self.state.lock();
        while state.generation > state.collected && state.arrived < state.workers {
            self.cond.wait(&mut state);
        }
        self.collect(&mut state);
    }

    fn collect(&self, state: &mut PhaseState) {
        state.collected = state.generation;
        state.arrived = 0;
        self.cond.notify_all();
    }

    /// Release all workers into the next phase.
    pub fn phase_end(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.generation, state.collected, "previous phase not collected");
        state.generation += 1;
        state.arrived = 0;
        self.cond.notify_all();
    }

    /// Make the controller's pending or next [`Self::phase_begin`] fail.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }
}

/// The worker side of a [`PhaseSynchronizer`]. Each worker thread owns one.
#[derive(Debug)]
pub struct WorkerPhase {
    sync: Arc<PhaseSynchronizer>,
    seen: u64,
}

impl WorkerPhase {
    /// Block until the controller releases a phase this worker has not run yet.
    pub fn start(&mut self) {
        let mut state = self.sync.state.lock();
        while state.generation <= self.seen {
            self.sync.cond.wait(&mut state);
        }
        self.seen = state.generation;
    }

    /// Signal that this worker is done with the current phase and wait until the controller
    /// has collected it.
    pub fn end(&mut self) {
        let mut state = self.sync.state.lock();
        state.arrived += 1;
        self.sync.cond.notify_all();
        while state.collected < self.seen {
            self.sync.cond.wait(&mut state);
        }
    }

    /// The generation of the phase this worker is in, or has last run.
    pub fn generation(&self) -> u64 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn begin_without_outstanding_phase_returns() {
        let sync = PhaseSynchronizer::new();
        assert!(sync.phase_begin().is_ok());
        sync.set_worker_count(3);
        assert!(sync.phase_begin().is_ok());
        assert_eq!(sync.generation(), 0);
    }

    #[test]
    fn workers_never_overlap_phases() {
        const WORKERS: usize = 6;
        const PHASES: usize = 50;
        let sync = Arc::new(PhaseSynchronizer::new());
        let done = Arc::new(AtomicUsize::new(0));
        sync.set_worker_count(WORKERS);

        let mut handles = Vec::new();
        for _ in 0..WORKERS {
            let mut phase = sync.worker();
            let done = done.clone();
            handles.push(std::thread::spawn(move || {
                for k in 0..PHASES {
                    phase.start();
                    // everything of the previous phase is visible, nothing of the next one
                    let seen = done.load(Ordering::SeqCst);
                    assert!(seen >= k * WORKERS && seen < (k + 1) * WORKERS);
                    assert_eq!(phase.generation(), (k + 1) as u64);
                    std::thread::yield_now();
                    done.fetch_add(1, Ordering::SeqCst);
                    phase.end();
                }
            }));
        }

        for k in 0..PHASES {
            sync.phase_end();
            sync.phase_begin().unwrap();
            assert_eq!(done.load(Ordering::SeqCst), (k + 1) * WORKERS);
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn worker_count_grows_between_phases() {
        let sync = Arc::new(PhaseSynchronizer::new());
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        let spawn = |sync: &Arc<PhaseSynchronizer>, phases: usize| {
            let mut phase = sync.worker();
            let done = done.clone();
            std::thread::spawn(move || {
                for _ in 0..phases {
                    phase.start();
                    done.fetch_add(1, Ordering::SeqCst);
                    phase.end();
                }
            })
        };

        sync.set_worker_count(1);
        handles.push(spawn(&sync, 2));
        sync.phase_end();
        sync.phase_begin().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);

        sync.set_worker_count(2);
        handles.push(spawn(&sync, 1));
        sync.phase_end();
        sync.phase_begin().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn interrupt_fails_pending_begin() {
        let sync = Arc::new(PhaseSynchronizer::new());
        sync.set_worker_count(1);
        let mut phase = sync.worker();
        sync.phase_end();

        let s = sync.clone();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            s.interrupt();
        });
        // the only worker never ends the phase
        assert!(matches!(sync.phase_begin(), Err(Error::Interrupted)));
        interrupter.join().unwrap();

        // the worker can still finish and be drained
        let worker = std::thread::spawn(move || {
            phase.start();
            phase.end();
        });
        sync.clear_interrupt();
        sync.phase_begin_uninterruptible();
        worker.join().unwrap();
    }
}
