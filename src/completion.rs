//! When workers stop issuing requests.
//!
//! A completion is shared by all workers of a run. [`CountCompletion`] bounds the total number of
//! requests across all workers, [`TimeCompletion`] bounds the wall-clock duration of the run.

use log::{info, trace};
use parking_lot::Mutex;
use quanta::Instant;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// Progress of a time-limited run is logged at most this often, over all workers.
pub const TIME_LOG_INTERVAL: Duration = Duration::from_secs(20);

/// A termination predicate shared by all workers of a run.
pub trait StressorCompletion: Send + Sync {
    /// Whether the calling worker should issue one more request. Every `true` counts as one
    /// accepted request.
    fn more_to_run(&self) -> bool;

    /// Called after the `i`-th request (starting from 1) of `thread_index`.
    fn log_progress(&self, i: u64, thread_index: usize);
}

/// Completes after a fixed total number of requests, however they are spread over workers.
#[derive(Debug)]
pub struct CountCompletion {
    requests_left: AtomicI64,
    total: u64,
    threads: usize,
    log_every: u64,
    start: Instant,
}

impl CountCompletion {
    /// `log_every` is the per-thread request interval of progress logs; `0` disables them.
    pub fn new(total: u64, threads: usize, log_every: u64) -> Self {
        Self {
            requests_left: AtomicI64::new(i64::try_from(total).unwrap_or(i64::MAX)),
            total,
            threads,
            log_every,
            start: Instant::now(),
        }
    }
}

impl StressorCompletion for CountCompletion {
    fn more_to_run(&self) -> bool {
        self.requests_left.fetch_sub(1, Ordering::Relaxed) > 0
    }

    fn log_progress(&self, i: u64, thread_index: usize) {
        if self.log_every == 0 || i % self.log_every != 0 {
            return;
        }
        let elapsed = self.start.elapsed();
        let per_thread = self.total as f64 / self.threads.max(1) as f64;
        let estimated_total = elapsed.mul_f64(per_thread / i as f64);
        let remaining = estimated_total.saturating_sub(elapsed);
        trace!("i={}, elapsed={:?}", i, elapsed);
        info!(
            "Thread index '{}' executed {} operations. Elapsed time: {:.2?}. \
             Estimated remaining: {:.2?}. Estimated total: {:.2?}",
            thread_index, i, elapsed, remaining, estimated_total
        );
    }
}

/// Completes once the run has lasted for a given duration. The clock starts with the first
/// request of any worker.
#[derive(Debug)]
pub struct TimeCompletion {
    duration: Duration,
    start: OnceLock<Instant>,
    last_print: Mutex<Option<Instant>>,
}

impl TimeCompletion {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            start: OnceLock::new(),
            last_print: Mutex::new(None),
        }
    }

    fn start(&self) -> Instant {
        *self.start.get_or_init(Instant::now)
    }
}

impl StressorCompletion for TimeCompletion {
    fn more_to_run(&self) -> bool {
        let start = self.start();
        Instant::now().saturating_duration_since(start) <= self.duration
    }

    fn log_progress(&self, i: u64, _thread_index: usize) {
        let now = Instant::now();
        let mut last_print = match self.last_print.try_lock() {
            Some(guard) => guard,
            // someone else is checking right now
            None => return,
        };
        if let Some(last) = *last_print {
            if now.saturating_duration_since(last) < TIME_LOG_INTERVAL {
                return;
            }
        }
        *last_print = Some(now);
        let elapsed = now.saturating_duration_since(self.start());
        let remaining = self.duration.saturating_sub(elapsed);
        info!(
            "Number of ops executed so far: {}. Elapsed time: {:.2?}. Remaining: {:.2?}. \
             Total: {:.2?}",
            i, elapsed, remaining, self.duration
        );
    }
}
