//! The stress worker.
//!
//! A [`Stressor`] owns one store handle and one [`Statistics`]. Workloads issue requests through
//! [`Stressor::make_request`], which times them, wraps them in transactions when enabled and
//! records the outcome. The thread body [`worker_main`] moves the worker through the phases
//! driven by the controller:
//!
//! ```txt
//! start -> [finished? end, exit] -> init -> end -> start -> request loop -> end -> ...
//! ```

use crate::completion::StressorCompletion;
use crate::error::StoreError;
use crate::logic::OperationLogic;
use crate::phase::WorkerPhase;
use crate::stats::Statistics;
use crate::{KVMap, KVMapHandle, OperationKind, Request};
use hashbrown::HashMap;
use log::{error, trace, warn};
use parking_lot::{Mutex, RwLock};
use quanta::Instant;
use std::hint::black_box;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A request that failed in the store. It has already been logged and recorded as an error
/// when the workload sees it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("request failed: {0}")]
pub struct RequestError(#[from] pub StoreError);

/// What a request returned.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum Response {
    /// Nothing, or a missing value.
    #[default]
    Empty,
    Value(Box<[u8]>),
    Entries(HashMap<Box<[u8]>, Box<[u8]>>),
    Range(Vec<(Box<[u8]>, Box<[u8]>)>),
}

impl Response {
    pub fn is_empty(&self) -> bool {
        matches!(self, Response::Empty)
    }

    pub fn into_value(self) -> Option<Box<[u8]>> {
        match self {
            Response::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Option<Box<[u8]>>> for Response {
    fn from(value: Option<Box<[u8]>>) -> Self {
        value.map_or(Response::Empty, Response::Value)
    }
}

impl From<crate::BulkResult> for Response {
    fn from(value: crate::BulkResult) -> Self {
        value.map_or(Response::Empty, Response::Entries)
    }
}

/// Transaction settings of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionConfig {
    pub enabled: bool,
    /// Number of requests in one transaction.
    pub size: usize,
    /// Commit at the end of a transaction, or roll back.
    pub commit: bool,
}

impl TransactionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            size: 1,
            commit: true,
        }
    }
}

#[derive(Debug, Default)]
struct TransactionState {
    remaining: usize,
    /// Time spent in the open transaction so far.
    duration: Duration,
}

pub struct Stressor {
    index: usize,
    bucket: Option<String>,
    handle: Box<dyn KVMapHandle>,
    tx_config: TransactionConfig,
    tx: TransactionState,
    stats: Statistics,
}

impl Stressor {
    pub fn new(
        index: usize,
        bucket: Option<String>,
        handle: Box<dyn KVMapHandle>,
        tx_config: TransactionConfig,
    ) -> Self {
        Self {
            index,
            bucket,
            handle,
            tx_config,
            tx: TransactionState::default(),
            stats: Statistics::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Direct access to the store handle, bypassing statistics. Used for preloading.
    pub fn handle(&mut self) -> &mut dyn KVMapHandle {
        self.handle.as_mut()
    }

    /// Put without timing or recording, into this worker's bucket.
    pub fn preload(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.handle.put(self.bucket.as_deref(), key, value)
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset(Instant::now());
    }

    /// Issue one request and record it.
    ///
    /// Opens a transaction first if transactions are enabled and none is open; if that fails,
    /// the failure is recorded and the request is skipped. A store failure is recorded as an
    /// error of the request's kind and returned.
    pub fn make_request(&mut self, request: Request) -> Result<Response, RequestError> {
        let mut start_tx = Duration::ZERO;
        if self.tx_config.enabled && self.tx.remaining == 0 {
            match self.start_transaction() {
                Ok(d) => {
                    start_tx = d;
                    self.tx.duration = d;
                    self.tx.remaining = self.tx_config.size;
                }
                Err(d) => {
                    self.stats
                        .register_error(d, Duration::ZERO, OperationKind::Transaction);
                    return Ok(Response::Empty);
                }
            }
        }

        let mut kind = request.kind();
        let start = Instant::now();
        let outcome = dispatch(self.handle.as_mut(), self.bucket.as_deref(), request);
        let elapsed = start.elapsed();
        let (successful, result) = match outcome {
            Ok((successful, response)) => {
                if kind == OperationKind::Get && response.is_empty() {
                    kind = OperationKind::GetNull;
                }
                self.tx.remaining = self.tx.remaining.saturating_sub(1);
                (successful, Ok(response))
            }
            Err(e) => {
                warn!("Error in request {}: {}", kind, e);
                self.tx.remaining = 0;
                (false, Err(RequestError(e)))
            }
        };
        self.tx.duration += elapsed;

        let mut end_tx = Duration::ZERO;
        if self.tx_config.enabled && self.tx.remaining == 0 {
            end_tx = self.close_transaction_now();
        }
        if successful {
            self.stats.register_request(elapsed, start_tx + end_tx, kind);
        } else {
            self.stats.register_error(elapsed, start_tx + end_tx, kind);
        }
        result
    }

    /// Close a transaction left open at the end of a run.
    pub fn close_transaction(&mut self) {
        if self.tx_config.enabled && self.tx.remaining > 0 {
            self.close_transaction_now();
            self.tx.remaining = 0;
        }
    }

    /// End the open transaction and record it. Returns the time spent ending it.
    fn close_transaction_now(&mut self) -> Duration {
        let (end, ok) = match self.end_transaction() {
            Ok(d) => (d, true),
            Err(d) => (d, false),
        };
        let total = self.tx.duration + end;
        if ok {
            self.stats
                .register_request(total, Duration::ZERO, OperationKind::Transaction);
        } else {
            self.stats
                .register_error(total, Duration::ZERO, OperationKind::Transaction);
        }
        self.tx.duration = Duration::ZERO;
        end
    }

    fn start_transaction(&mut self) -> Result<Duration, Duration> {
        let start = Instant::now();
        match self.handle.start_transaction() {
            Ok(()) => Ok(start.elapsed()),
            Err(e) => {
                error!("Failed to start transaction: {}", e);
                Err(start.elapsed())
            }
        }
    }

    fn end_transaction(&mut self) -> Result<Duration, Duration> {
        let start = Instant::now();
        match self.handle.end_transaction(self.tx_config.commit) {
            Ok(()) => Ok(start.elapsed()),
            Err(e) => {
                error!("Failed to end transaction: {}", e);
                Err(start.elapsed())
            }
        }
    }

    /// Run requests until the completion says otherwise, then close any open transaction.
    pub fn run(
        &mut self,
        logic: &mut dyn OperationLogic,
        completion: &dyn StressorCompletion,
        terminated: &AtomicBool,
    ) {
        trace!("Starting stressor {}", self.index);
        let mut i = 0u64;
        while !terminated.load(Ordering::Relaxed) && completion.more_to_run() {
            // failures are already logged and recorded
            let _ = black_box(logic.run(self));
            i += 1;
            completion.log_progress(i, self.index);
        }
        self.close_transaction();
    }
}

/// Issue the store call of a request. Returns whether the outcome is the expected one, and the
/// response.
fn dispatch(
    handle: &mut dyn KVMapHandle,
    bucket: Option<&str>,
    request: Request,
) -> Result<(bool, Response), StoreError> {
    let response: Response = match request {
        Request::Get { key } => handle.get(bucket, &key)?.into(),
        Request::Put { key, value } => {
            handle.put(bucket, &key, &value)?;
            Response::Empty
        }
        Request::Remove { key } => handle.remove(bucket, &key)?.into(),
        Request::Scan { key, n } => Response::Range(handle.scan(bucket, &key, n)?),
        Request::RemoveValid { key, expected } => {
            let removed = atomic(handle)?.remove_if(bucket, &key, &expected)?;
            return Ok((removed, Response::Empty));
        }
        Request::RemoveInvalid { key, expected } => {
            let removed = atomic(handle)?.remove_if(bucket, &key, &expected)?;
            return Ok((!removed, Response::Empty));
        }
        Request::PutIfAbsentIsAbsent { key, value } => {
            let previous = atomic(handle)?.put_if_absent(bucket, &key, &value)?;
            return Ok((previous.is_none(), previous.into()));
        }
        Request::PutIfAbsentNotAbsent {
            key,
            value,
            expected,
        } => {
            let previous = atomic(handle)?.put_if_absent(bucket, &key, &value)?;
            let successful = previous.as_deref() == Some(&*expected);
            return Ok((successful, previous.into()));
        }
        Request::ReplaceValid { key, old, new } => {
            let replaced = atomic(handle)?.replace(bucket, &key, &old, &new)?;
            return Ok((replaced, Response::Empty));
        }
        Request::ReplaceInvalid { key, old, new } => {
            let replaced = atomic(handle)?.replace(bucket, &key, &old, &new)?;
            return Ok((!replaced, Response::Empty));
        }
        Request::GetAll { keys, prefer_async } => {
            bulk(handle)?.get_all(bucket, &keys, prefer_async)?.into()
        }
        Request::PutAll {
            entries,
            prefer_async,
        } => {
            // the previous entries are not interesting
            bulk(handle)?.put_all(bucket, &entries, prefer_async)?;
            Response::Empty
        }
        Request::RemoveAll { keys, prefer_async } => {
            bulk(handle)?.remove_all(bucket, &keys, prefer_async)?.into()
        }
    };
    Ok((true, response))
}

fn atomic(
    handle: &mut dyn KVMapHandle,
) -> Result<&mut dyn crate::AtomicKVMapHandle, StoreError> {
    handle
        .atomic()
        .ok_or(StoreError::Unsupported("atomic operations"))
}

fn bulk(handle: &mut dyn KVMapHandle) -> Result<&mut dyn crate::BulkKVMapHandle, StoreError> {
    handle
        .bulk()
        .ok_or(StoreError::Unsupported("bulk operations"))
}

// {{{ worker

/// State shared by the controller and all workers of a stress stage.
pub(crate) struct WorkerShared {
    pub map: Arc<dyn KVMap>,
    /// Set by the controller before releasing the final phase.
    pub finished: AtomicBool,
    /// Set by any worker that fails fatally. The remaining phases are skipped.
    pub terminated: AtomicBool,
    /// Replaced by the controller between runs.
    pub completion: RwLock<Arc<dyn StressorCompletion>>,
}

/// Everything a worker thread needs, moved into it at spawn.
pub(crate) struct Worker {
    pub index: usize,
    pub bucket: Option<String>,
    pub tx_config: TransactionConfig,
    pub pin: bool,
    pub logic: Box<dyn OperationLogic>,
    pub phase: WorkerPhase,
    pub shared: Arc<WorkerShared>,
    /// Statistics of the last run, published at the end of every run phase.
    pub slot: Arc<Mutex<Statistics>>,
}

pub(crate) fn worker_main(worker: Worker) {
    let Worker {
        index,
        bucket,
        tx_config,
        pin,
        mut logic,
        mut phase,
        shared,
        slot,
    } = worker;
    if pin {
        shared.map.thread().pin(index);
    }
    let mut stressor = Stressor::new(index, bucket, shared.map.handle(), tx_config);
    loop {
        phase.start();
        if shared.finished.load(Ordering::Acquire) {
            phase.end();
            break;
        }
        if !shared.terminated.load(Ordering::Acquire) {
            let init = catch_unwind(AssertUnwindSafe(|| logic.init(&mut stressor)));
            if init.is_err() {
                shared.terminated.store(true, Ordering::Release);
                error!("Unexpected error in stressor {} while loading keys", index);
            }
        }
        stressor.reset_stats();
        phase.end();

        phase.start();
        if !shared.terminated.load(Ordering::Acquire) {
            let completion = shared.completion.read().clone();
            stressor.reset_stats();
            let run = catch_unwind(AssertUnwindSafe(|| {
                stressor.run(logic.as_mut(), completion.as_ref(), &shared.terminated)
            }));
            if run.is_err() {
                shared.terminated.store(true, Ordering::Release);
                error!("Unexpected error in stressor {}", index);
            }
        }
        stressor.stats.finish(Instant::now());
        *slot.lock() = stressor.stats.copy();
        phase.end();
    }
    trace!("Stressor {} exits", index);
}

// }}} worker

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::hashmap::MutexHashMap;
    use std::sync::atomic::AtomicUsize;

    /// A handle that either fails every call or holds nothing, and counts transactions.
    struct TestHandle {
        pub fail: bool,
        pub fail_tx_start: bool,
        pub starts: Arc<AtomicUsize>,
        pub ends: Arc<AtomicUsize>,
    }

    impl TestHandle {
        fn new(fail: bool, fail_tx_start: bool) -> Self {
            Self {
                fail,
                fail_tx_start,
                starts: Arc::new(AtomicUsize::new(0)),
                ends: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn check(&self, op: &str) -> Result<(), StoreError> {
            match self.fail {
                true => Err(StoreError::Backend(op.to_string())),
                false => Ok(()),
            }
        }
    }

    impl KVMapHandle for TestHandle {
        fn put(&mut self, _: Option<&str>, _: &[u8], _: &[u8]) -> Result<(), StoreError> {
            self.check("put")
        }

        fn get(&mut self, _: Option<&str>, _: &[u8]) -> Result<Option<Box<[u8]>>, StoreError> {
            self.check("get").map(|_| None)
        }

        fn remove(
            &mut self,
            _: Option<&str>,
            _: &[u8],
        ) -> Result<Option<Box<[u8]>>, StoreError> {
            self.check("remove").map(|_| None)
        }

        fn start_transaction(&mut self) -> Result<(), StoreError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            match self.fail_tx_start {
                true => Err(StoreError::Transaction("start".to_string())),
                false => Ok(()),
            }
        }

        fn end_transaction(&mut self, _commit: bool) -> Result<(), StoreError> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stressor(tx_config: TransactionConfig) -> Stressor {
        let map = MutexHashMap::with_shards(4);
        Stressor::new(0, None, map.handle(), tx_config)
    }

    fn key(k: &[u8]) -> Box<[u8]> {
        k.into()
    }

    fn count(s: &Stressor, kind: OperationKind) -> (u64, u64) {
        s.stats()
            .get(kind)
            .map_or((0, 0), |o| (o.requests(), o.errors()))
    }

    #[test]
    fn get_records_null() {
        let mut s = stressor(TransactionConfig::disabled());
        let r = s.make_request(Request::Get { key: key(b"a") }).unwrap();
        assert!(r.is_empty());
        s.make_request(Request::Put {
            key: key(b"a"),
            value: key(b"1"),
        })
        .unwrap();
        let r = s.make_request(Request::Get { key: key(b"a") }).unwrap();
        assert_eq!(r.into_value(), Some(key(b"1")));
        assert_eq!(count(&s, OperationKind::GetNull), (1, 0));
        assert_eq!(count(&s, OperationKind::Get), (1, 0));
        assert_eq!(count(&s, OperationKind::Put), (1, 0));
        assert!(s.stats().get(OperationKind::Transaction).is_none());
    }

    #[test]
    fn conditional_outcomes() {
        let mut s = stressor(TransactionConfig::disabled());
        s.make_request(Request::PutIfAbsentIsAbsent {
            key: key(b"k"),
            value: key(b"v1"),
        })
        .unwrap();
        // refused as expected
        s.make_request(Request::RemoveInvalid {
            key: key(b"k"),
            expected: key(b"zz"),
        })
        .unwrap();
        s.make_request(Request::ReplaceInvalid {
            key: key(b"k"),
            old: key(b"zz"),
            new: key(b"v2"),
        })
        .unwrap();
        s.make_request(Request::PutIfAbsentNotAbsent {
            key: key(b"k"),
            value: key(b"v3"),
            expected: key(b"v1"),
        })
        .unwrap();
        s.make_request(Request::ReplaceValid {
            key: key(b"k"),
            old: key(b"v1"),
            new: key(b"v2"),
        })
        .unwrap();
        // wrong expectation: v2 is stored
        s.make_request(Request::RemoveValid {
            key: key(b"k"),
            expected: key(b"v1"),
        })
        .unwrap();
        s.make_request(Request::PutIfAbsentIsAbsent {
            key: key(b"k"),
            value: key(b"v4"),
        })
        .unwrap();

        assert_eq!(count(&s, OperationKind::PutIfAbsentIsAbsent), (1, 1));
        assert_eq!(count(&s, OperationKind::RemoveInvalid), (1, 0));
        assert_eq!(count(&s, OperationKind::ReplaceInvalid), (1, 0));
        assert_eq!(count(&s, OperationKind::PutIfAbsentNotAbsent), (1, 0));
        assert_eq!(count(&s, OperationKind::ReplaceValid), (1, 0));
        assert_eq!(count(&s, OperationKind::RemoveValid), (0, 1));
    }

    #[test]
    fn failures_are_recorded_and_returned() {
        let handle = TestHandle::new(true, false);
        let (starts, ends) = (handle.starts.clone(), handle.ends.clone());
        let tx = TransactionConfig {
            enabled: true,
            size: 10,
            commit: true,
        };
        let mut s = Stressor::new(1, Some("b".to_string()), Box::new(handle), tx);
        let r = s.make_request(Request::Get { key: key(b"a") });
        assert!(matches!(r, Err(RequestError(StoreError::Backend(_)))));
        // a failed request closes the transaction
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(count(&s, OperationKind::Get), (0, 1));
        assert_eq!(count(&s, OperationKind::Transaction), (1, 0));
        assert_eq!(s.stats().requests(), 0);
        assert_eq!(s.stats().errors(), 1);
    }

    #[test]
    fn unsupported_capability_is_a_failure() {
        let mut s = Stressor::new(
            0,
            None,
            crate::stores::null::NullMap::new().handle(),
            TransactionConfig::disabled(),
        );
        let r = s.make_request(Request::GetAll {
            keys: vec![key(b"a"), key(b"b")],
            prefer_async: false,
        });
        assert_eq!(r, Err(RequestError(StoreError::Unsupported("bulk operations"))));
        assert_eq!(count(&s, OperationKind::GetAll), (0, 1));
    }

    #[test]
    fn scan_is_a_query() {
        use crate::stores::btreemap::MutexBTreeMap;

        let map = MutexBTreeMap::default();
        let mut s = Stressor::new(0, None, map.handle(), TransactionConfig::disabled());
        for k in [b"a", b"c", b"e"] {
            s.make_request(Request::Put {
                key: key(k),
                value: key(b"v"),
            })
            .unwrap();
        }
        let r = s
            .make_request(Request::Scan {
                key: key(b"b"),
                n: 5,
            })
            .unwrap();
        match r {
            Response::Range(entries) => assert_eq!(entries.len(), 2),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(count(&s, OperationKind::Query), (1, 0));

        // hash maps have no order to scan
        let mut s = stressor(TransactionConfig::disabled());
        let r = s.make_request(Request::Scan {
            key: key(b"b"),
            n: 5,
        });
        assert_eq!(r, Err(RequestError(StoreError::Unsupported("scan"))));
        assert_eq!(count(&s, OperationKind::Query), (0, 1));
        assert_eq!(s.stats().results_map(1, "").get("QUERY_ERRORS"), Some(&1.0));
    }

    #[test]
    fn transaction_start_failure_skips_request() {
        let handle = TestHandle::new(true, true);
        let ends = handle.ends.clone();
        let tx = TransactionConfig {
            enabled: true,
            size: 2,
            commit: false,
        };
        let mut s = Stressor::new(0, None, Box::new(handle), tx);
        let r = s.make_request(Request::Get { key: key(b"a") }).unwrap();
        assert!(r.is_empty());
        assert_eq!(count(&s, OperationKind::Transaction), (0, 1));
        assert!(s.stats().get(OperationKind::Get).is_none());
        assert_eq!(ends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transactions_group_requests() {
        let tx = TransactionConfig {
            enabled: true,
            size: 3,
            commit: true,
        };
        let handle = TestHandle::new(false, false);
        let (starts, ends) = (handle.starts.clone(), handle.ends.clone());
        let mut s = Stressor::new(0, None, Box::new(handle), tx);
        for i in 0..7u8 {
            s.make_request(Request::Put {
                key: key(&[i]),
                value: key(&[i]),
            })
            .unwrap();
        }
        // two full transactions, one open with a single request
        assert_eq!(count(&s, OperationKind::Transaction), (2, 0));
        s.close_transaction();
        assert_eq!(count(&s, OperationKind::Transaction), (3, 0));
        s.close_transaction();
        assert_eq!(count(&s, OperationKind::Transaction), (3, 0));
        assert_eq!(count(&s, OperationKind::Put), (7, 0));
        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert_eq!(ends.load(Ordering::SeqCst), 3);
    }
}
