//! Per-thread request statistics and their aggregation.
//!
//! Every worker records into its own [`Statistics`] during a run, without any synchronization.
//! At the end of the run the controller merges all of them. Merging is commutative and
//! associative, so the order in which workers finish does not matter.
//!
//! ## Result Map
//!
//! [`Statistics::results_map`] renders a flat map. For every operation kind that was issued,
//! with `<K>` the kind's name (e.g. `GET`, `PUT_IF_ABSENT_IS_ABSENT`, `TRANSACTION`):
//!
//! - `<K>_COUNT`, `<K>_ERRORS`: successful and failed requests.
//! - `<K>_AVG_NS`, `<K>_MAX_NS`, `<K>_P50_NS`, `<K>_P95_NS`, `<K>_P99_NS`: response time.
//! - `<K>_AVG_TX_OVERHEAD_NS`: average transaction begin/commit time attributed to the request.
//! - `<K>_PER_SEC`: requests per second of this kind over all threads.
//!
//! And for the whole snapshot:
//!
//! - `REQUESTS`, `ERRORS`: over all kinds except `TRANSACTION`.
//! - `DURATION_NS`: wall-clock time between the earliest reset and the latest finish.
//! - `THREADS`: the thread count passed in.
//! - `REQ_PER_SEC`: `THREADS` times [`Statistics::operations_per_second`] with overhead.
//!
//! All keys are prefixed with the given prefix.

use crate::OperationKind;
use hashbrown::HashMap;
use hdrhistogram::Histogram;
use quanta::Instant;
use std::collections::BTreeMap;
use std::time::Duration;

pub const NS_IN_SEC: f64 = 1_000_000_000.0;

/// The flat metric map consumed by reporting.
pub type ResultsMap = BTreeMap<String, f64>;

/// Counters of a single operation kind.
#[derive(Clone, Debug)]
pub struct OperationStats {
    requests: u64,
    errors: u64,
    response_time: u64,
    response_time_max: u64,
    tx_overhead: u64,
    /// Response times in ns, successes and errors alike.
    hdr: Histogram<u64>,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            requests: 0,
            errors: 0,
            response_time: 0,
            response_time_max: 0,
            tx_overhead: 0,
            hdr: new_histogram(),
        }
    }

    fn record(&mut self, response_time: Duration, tx_overhead: Duration) {
        let ns = response_time.as_nanos() as u64;
        self.response_time += ns;
        self.response_time_max = self.response_time_max.max(ns);
        self.tx_overhead += tx_overhead.as_nanos() as u64;
        self.hdr.saturating_record(ns);
    }

    fn merge(&mut self, other: &OperationStats) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.response_time += other.response_time;
        self.response_time_max = self.response_time_max.max(other.response_time_max);
        self.tx_overhead += other.tx_overhead;
        if let Err(e) = self.hdr.add(&other.hdr) {
            log::warn!("Failed to merge latency histograms: {}", e);
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Cumulative response time in ns.
    pub fn response_time(&self) -> u64 {
        self.response_time
    }

    /// Cumulative transaction overhead in ns.
    pub fn tx_overhead(&self) -> u64 {
        self.tx_overhead
    }

    fn total(&self) -> u64 {
        self.requests + self.errors
    }
}

fn new_histogram() -> Histogram<u64> {
    // auto-resizing, three significant figures
    Histogram::new(3).unwrap_or_else(|e| panic!("invalid histogram parameters: {}", e))
}

/// Statistics of one worker, or the merge of several.
#[derive(Clone, Debug)]
pub struct Statistics {
    operations: HashMap<OperationKind, OperationStats>,
    begin: Instant,
    end: Option<Instant>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
            begin: Instant::now(),
            end: None,
        }
    }

    /// Record a successful request.
    pub fn register_request(
        &mut self,
        response_time: Duration,
        tx_overhead: Duration,
        kind: OperationKind,
    ) {
        let stats = self.entry(kind);
        stats.requests += 1;
        stats.record(response_time, tx_overhead);
    }

    /// Record a failed request, or a conditional operation whose outcome was not the expected
    /// one.
    pub fn register_error(
        &mut self,
        response_time: Duration,
        tx_overhead: Duration,
        kind: OperationKind,
    ) {
        let stats = self.entry(kind);
        stats.errors += 1;
        stats.record(response_time, tx_overhead);
    }

    fn entry(&mut self, kind: OperationKind) -> &mut OperationStats {
        self.operations
            .entry(kind)
            .or_insert_with(OperationStats::new)
    }

    /// Drop all counters and start a new interval at `time`.
    pub fn reset(&mut self, time: Instant) {
        self.operations.clear();
        self.begin = time;
        self.end = None;
    }

    /// Close the measured interval.
    pub fn finish(&mut self, time: Instant) {
        self.end = Some(time);
    }

    /// An independent copy of this snapshot.
    pub fn copy(&self) -> Statistics {
        self.clone()
    }

    /// Fold `other` into this snapshot. The interval becomes the union of both.
    pub fn merge(&mut self, other: &Statistics) {
        for (kind, stats) in other.operations.iter() {
            self.entry(*kind).merge(stats);
        }
        self.begin = self.begin.min(other.begin);
        self.end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn get(&self, kind: OperationKind) -> Option<&OperationStats> {
        self.operations.get(&kind)
    }

    /// Successful requests, transactions excluded.
    pub fn requests(&self) -> u64 {
        self.fold(|s| s.requests)
    }

    /// Failed requests, transactions excluded.
    pub fn errors(&self) -> u64 {
        self.fold(|s| s.errors)
    }

    fn fold(&self, f: impl Fn(&OperationStats) -> u64) -> u64 {
        self.operations
            .iter()
            .filter(|(kind, _)| **kind != OperationKind::Transaction)
            .map(|(_, s)| f(s))
            .sum()
    }

    /// Wall-clock time covered by this snapshot.
    pub fn duration(&self) -> Duration {
        let end = self.end.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.begin)
    }

    /// Requests per second of busy time: all issued requests divided by the time spent inside
    /// them, optionally including the transaction overhead attributed to them.
    ///
    /// For a merged snapshot this is the average per-thread rate; multiply by the thread count
    /// for the aggregate throughput. Idle time between requests is not counted: the wall-clock
    /// length of a run is reported separately as `DURATION_NS` in [`Statistics::results_map`].
    pub fn operations_per_second(&self, include_overhead: bool) -> f64 {
        let mut requests = 0u64;
        let mut busy = 0u64;
        for (kind, s) in self.operations.iter() {
            if *kind == OperationKind::Transaction {
                continue;
            }
            requests += s.total();
            busy += s.response_time;
            if include_overhead {
                busy += s.tx_overhead;
            }
        }
        if busy == 0 {
            return 0.0;
        }
        requests as f64 * NS_IN_SEC / busy as f64
    }

    /// Render the snapshot into a flat map, see the module documentation for the keys.
    pub fn results_map(&self, threads: usize, prefix: &str) -> ResultsMap {
        let mut results = ResultsMap::new();
        let mut kinds: Vec<&OperationKind> = self.operations.keys().collect();
        kinds.sort();
        for kind in kinds {
            let s = &self.operations[kind];
            let total = s.total();
            if total == 0 {
                continue;
            }
            let key = |suffix: &str| format!("{}{}_{}", prefix, kind.name(), suffix);
            results.insert(key("COUNT"), s.requests as f64);
            results.insert(key("ERRORS"), s.errors as f64);
            results.insert(key("AVG_NS"), s.response_time as f64 / total as f64);
            results.insert(key("MAX_NS"), s.response_time_max as f64);
            results.insert(key("P50_NS"), s.hdr.value_at_quantile(0.50) as f64);
            results.insert(key("P95_NS"), s.hdr.value_at_quantile(0.95) as f64);
            results.insert(key("P99_NS"), s.hdr.value_at_quantile(0.99) as f64);
            results.insert(
                key("AVG_TX_OVERHEAD_NS"),
                s.tx_overhead as f64 / total as f64,
            );
            let per_sec = match s.response_time {
                0 => 0.0,
                t => total as f64 * NS_IN_SEC / t as f64 * threads as f64,
            };
            results.insert(key("PER_SEC"), per_sec);
        }
        results.insert(format!("{}REQUESTS", prefix), self.requests() as f64);
        results.insert(format!("{}ERRORS", prefix), self.errors() as f64);
        results.insert(
            format!("{}DURATION_NS", prefix),
            self.duration().as_nanos() as f64,
        );
        results.insert(format!("{}THREADS", prefix), threads as f64);
        results.insert(
            format!("{}REQ_PER_SEC", prefix),
            threads as f64 * self.operations_per_second(true),
        );
        results
    }
}
