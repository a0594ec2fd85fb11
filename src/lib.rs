#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A stress harness for key-value stores driven by phase-synchronized worker threads.
//!
//! With `kvstress`, you describe a stress run in TOML: how many worker threads hammer the store,
//! how long (or how many requests), the size of the keyspace and of the values, and the mix of
//! reads, writes, removes, bulk and conditional operations. The harness preloads keys, releases
//! all workers at the same time, and merges per-thread statistics into a flat result map.
//!
//! A few key design choices include:
//!
//! - Keys and values are variable-sized byte arrays, represented as [`u8`] slices on the heap.
//! - The controller and the workers move through synchronized phases (preload, rendezvous, run,
//! drain) using the two-stage barrier in [`mod@phase`]. A worker never starts phase `k + 1`
//! before the controller has seen every worker finish phase `k`.
//! - Workloads are strategies ([`logic::OperationLogic`]) selected once at setup from the
//! configuration and the capabilities the store declares ([`Capabilities`]).
//! - Stores are registered dynamically with [`inventory`], so that users can stress their own
//! store by implementing [`KVMap`] and [`KVMapHandle`] and reusing [`cmdline()`].
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@stress`] for the config format of a stress run.
//! - [`mod@stores`] for the config format of a built-in key-value store.
//! - [`cmdline()`] for the usage of the default command line interface.

use crate::error::StoreError;
use hashbrown::HashMap;
use std::fmt;

/// A thread-safe key-value store under test.
///
/// This trait is used for owned stores, with which a per-thread handle can be created. Every
/// worker creates its own handle inside its thread.
pub trait KVMap: Send + Sync + 'static {
    /// Create a handle that can be used by one worker thread.
    fn handle(&self) -> Box<dyn KVMapHandle>;

    /// The optional operation families this store supports. Queried once before a run.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Whether requests against `bucket` should be wrapped in transactions by default.
    fn is_transactional(&self, _bucket: Option<&str>) -> bool {
        false
    }

    /// Number of entries held by this node.
    fn local_size(&self) -> usize;

    /// Number of entries held by the whole store (cluster-wide if it has one).
    fn total_size(&self) -> usize {
        self.local_size()
    }

    /// A human readable description, logged when a run starts.
    fn info(&self) -> String;

    fn thread(&self) -> Box<dyn crate::thread::Thread> {
        Box::new(self::thread::DefaultThread)
    }
}

/// A per-thread handle that references a [`KVMap`].
///
/// The handle is the real object that exposes a key-value interface. Failures are reported as
/// [`StoreError`] and recorded by the worker as errors of the corresponding operation.
pub trait KVMapHandle {
    /// Adding a new key-value pair or blindly updating an existing key's value.
    fn put(&mut self, bucket: Option<&str>, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Retrieving the value of a key if it exists.
    fn get(&mut self, bucket: Option<&str>, key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError>;

    /// Removing a key if it exists, returning the previous value.
    fn remove(&mut self, bucket: Option<&str>, key: &[u8])
        -> Result<Option<Box<[u8]>>, StoreError>;

    /// Querying a range starting from the first key greater than or equal to the given key.
    fn scan(
        &mut self,
        _bucket: Option<&str>,
        _key: &[u8],
        _n: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        Err(StoreError::Unsupported("scan"))
    }

    fn start_transaction(&mut self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("transactions"))
    }

    /// Commit (`commit == true`) or roll back the open transaction.
    fn end_transaction(&mut self, _commit: bool) -> Result<(), StoreError> {
        Ok(())
    }

    /// Conditional operations, if the store declares [`Capabilities::atomic`].
    fn atomic(&mut self) -> Option<&mut dyn AtomicKVMapHandle> {
        None
    }

    /// Multi-key operations, if the store declares [`Capabilities::bulk`].
    fn bulk(&mut self) -> Option<&mut dyn BulkKVMapHandle> {
        None
    }
}

/// Compare-and-swap style operations.
pub trait AtomicKVMapHandle {
    /// Replace the value of `key` with `new` only if it currently equals `old`.
    fn replace(
        &mut self,
        bucket: Option<&str>,
        key: &[u8],
        old: &[u8],
        new: &[u8],
    ) -> Result<bool, StoreError>;

    /// Insert only if the key is absent. Returns the existing value otherwise.
    fn put_if_absent(
        &mut self,
        bucket: Option<&str>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Box<[u8]>>, StoreError>;

    /// Remove `key` only if its value currently equals `old`.
    fn remove_if(&mut self, bucket: Option<&str>, key: &[u8], old: &[u8])
        -> Result<bool, StoreError>;
}

/// Result of a bulk operation: the store may or may not report previous entries.
pub type BulkResult = Option<HashMap<Box<[u8]>, Box<[u8]>>>;

/// Operations on many keys at once. `prefer_async` asks the store to issue several asynchronous
/// single-key operations instead of its native multi-key call, when it has both.
pub trait BulkKVMapHandle {
    fn get_all(
        &mut self,
        bucket: Option<&str>,
        keys: &[Box<[u8]>],
        prefer_async: bool,
    ) -> Result<BulkResult, StoreError>;

    fn put_all(
        &mut self,
        bucket: Option<&str>,
        entries: &[(Box<[u8]>, Box<[u8]>)],
        prefer_async: bool,
    ) -> Result<BulkResult, StoreError>;

    fn remove_all(
        &mut self,
        bucket: Option<&str>,
        keys: &[Box<[u8]>],
        prefer_async: bool,
    ) -> Result<BulkResult, StoreError>;
}

/// The optional operation families of a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub atomic: bool,
    pub bulk: bool,
}

/// A single logical request issued by a workload against a store handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Get {
        key: Box<[u8]>,
    },
    Put {
        key: Box<[u8]>,
        value: Box<[u8]>,
    },
    Remove {
        key: Box<[u8]>,
    },
    /// Range query, the store's notion of a query.
    Scan {
        key: Box<[u8]>,
        n: usize,
    },
    /// Conditional remove with the value this worker believes is stored. Must succeed.
    RemoveValid {
        key: Box<[u8]>,
        expected: Box<[u8]>,
    },
    /// Conditional remove with a stale value. Succeeds only if the store refuses it.
    RemoveInvalid {
        key: Box<[u8]>,
        expected: Box<[u8]>,
    },
    /// Put-if-absent on a key believed to be absent. Must insert.
    PutIfAbsentIsAbsent {
        key: Box<[u8]>,
        value: Box<[u8]>,
    },
    /// Put-if-absent on a key believed to hold `expected`. Must return `expected`.
    PutIfAbsentNotAbsent {
        key: Box<[u8]>,
        value: Box<[u8]>,
        expected: Box<[u8]>,
    },
    ReplaceValid {
        key: Box<[u8]>,
        old: Box<[u8]>,
        new: Box<[u8]>,
    },
    /// Replace with a stale expected value. Succeeds only if the store refuses it.
    ReplaceInvalid {
        key: Box<[u8]>,
        old: Box<[u8]>,
        new: Box<[u8]>,
    },
    GetAll {
        keys: Vec<Box<[u8]>>,
        prefer_async: bool,
    },
    PutAll {
        entries: Vec<(Box<[u8]>, Box<[u8]>)>,
        prefer_async: bool,
    },
    RemoveAll {
        keys: Vec<Box<[u8]>>,
        prefer_async: bool,
    },
}

impl Request {
    /// The statistic kind this request is recorded under, before its outcome is known.
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Get { .. } => OperationKind::Get,
            Request::Put { .. } => OperationKind::Put,
            Request::Remove { .. } => OperationKind::Remove,
            Request::Scan { .. } => OperationKind::Query,
            Request::RemoveValid { .. } => OperationKind::RemoveValid,
            Request::RemoveInvalid { .. } => OperationKind::RemoveInvalid,
            Request::PutIfAbsentIsAbsent { .. } => OperationKind::PutIfAbsentIsAbsent,
            Request::PutIfAbsentNotAbsent { .. } => OperationKind::PutIfAbsentNotAbsent,
            Request::ReplaceValid { .. } => OperationKind::ReplaceValid,
            Request::ReplaceInvalid { .. } => OperationKind::ReplaceInvalid,
            Request::GetAll { prefer_async, .. } => match prefer_async {
                true => OperationKind::GetAllViaAsync,
                false => OperationKind::GetAll,
            },
            Request::PutAll { prefer_async, .. } => match prefer_async {
                true => OperationKind::PutAllViaAsync,
                false => OperationKind::PutAll,
            },
            Request::RemoveAll { prefer_async, .. } => match prefer_async {
                true => OperationKind::RemoveAllViaAsync,
                false => OperationKind::RemoveAll,
            },
        }
    }
}

/// The kinds under which statistics are recorded.
///
/// `GetNull` is a `Get` that found no value. `Transaction` covers whole transactions (begin, the
/// operations inside and the commit or rollback) separately from the operations themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Get,
    GetNull,
    Put,
    Remove,
    Query,
    RemoveValid,
    RemoveInvalid,
    PutIfAbsentIsAbsent,
    PutIfAbsentNotAbsent,
    ReplaceValid,
    ReplaceInvalid,
    GetAll,
    GetAllViaAsync,
    PutAll,
    PutAllViaAsync,
    RemoveAll,
    RemoveAllViaAsync,
    Transaction,
}

impl OperationKind {
    /// The stable upper-case name used in result maps.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Get => "GET",
            OperationKind::GetNull => "GET_NULL",
            OperationKind::Put => "PUT",
            OperationKind::Remove => "REMOVE",
            OperationKind::Query => "QUERY",
            OperationKind::RemoveValid => "REMOVE_VALID",
            OperationKind::RemoveInvalid => "REMOVE_INVALID",
            OperationKind::PutIfAbsentIsAbsent => "PUT_IF_ABSENT_IS_ABSENT",
            OperationKind::PutIfAbsentNotAbsent => "PUT_IF_ABSENT_NOT_ABSENT",
            OperationKind::ReplaceValid => "REPLACE_VALID",
            OperationKind::ReplaceInvalid => "REPLACE_INVALID",
            OperationKind::GetAll => "GET_ALL",
            OperationKind::GetAllViaAsync => "GET_ALL_VIA_ASYNC",
            OperationKind::PutAll => "PUT_ALL",
            OperationKind::PutAllViaAsync => "PUT_ALL_VIA_ASYNC",
            OperationKind::RemoveAll => "REMOVE_ALL",
            OperationKind::RemoveAllViaAsync => "REMOVE_ALL_VIA_ASYNC",
            OperationKind::Transaction => "TRANSACTION",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod cmdline;
pub mod completion;
pub mod error;
pub mod generator;
pub mod logic;
pub mod phase;
pub mod stats;
pub mod stores;
pub mod stress;
pub mod stressor;
pub mod thread;
pub mod workload;

pub use cmdline::cmdline;
pub use error::{Error, Result};

pub extern crate inventory;
pub extern crate toml;
