//! Workload strategies.
//!
//! Each worker owns one [`OperationLogic`]. [`OperationLogic::init`] runs in the preload phase
//! and may load keys into the store; [`OperationLogic::run`] issues exactly one logical request
//! (which may be a bulk request) through the worker.
//!
//! The strategy of a stage is chosen once, before any worker starts, by [`LogicKind::select`]
//! from the workload and the [`Capabilities`] of the store:
//!
//! | Workload                         | Strategy                         |
//! |----------------------------------|----------------------------------|
//! | `fixed_keys = false`             | [`changing::ChangingSetLogic`]   |
//! | `bulk_size > 1`                  | [`bulk::BulkLogic`]              |
//! | `atomics = true`                 | [`atomic::AtomicLogic`]          |
//! | `shared_keys = true`             | [`fixed::FixedSetLogic`], shared |
//! | otherwise                        | [`fixed::FixedSetLogic`], per thread |

use crate::error::{Error, Result};
use crate::stressor::{RequestError, Response, Stressor};
use crate::workload::WorkloadSpec;
use crate::{Capabilities, KVMap};
use log::{info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub mod atomic;
pub mod bulk;
pub mod changing;
pub mod fixed;

/// Preloads one worker's keys are logged every this many keys.
pub const LOAD_LOG_INTERVAL: u64 = 100_000;

/// A workload strategy, owned by one worker.
pub trait OperationLogic: Send {
    /// Prepare the worker's state before a run. Called again before every run of the same
    /// stage, so loading must be idempotent.
    fn init(&mut self, stressor: &mut Stressor);

    /// Issue one logical request.
    fn run(&mut self, stressor: &mut Stressor) -> std::result::Result<Response, RequestError>;
}

/// State shared by the strategies of all workers of a stage.
pub struct LogicContext {
    pub spec: Arc<WorkloadSpec>,
    pub map: Arc<dyn KVMap>,
    /// The largest number of workers of the stage. Separates the key ranges of nodes.
    max_threads: usize,
    /// The number of workers of the current run.
    threads: AtomicUsize,
    /// Keys loaded by all workers; the next key index in a changing set.
    pub keys_loaded: AtomicU64,
    pub(crate) pool: fixed::SharedPool,
}

impl LogicContext {
    pub fn new(spec: Arc<WorkloadSpec>, map: Arc<dyn KVMap>, max_threads: usize) -> Self {
        Self {
            spec,
            map,
            max_threads,
            threads: AtomicUsize::new(max_threads),
            keys_loaded: AtomicU64::new(0),
            pool: fixed::SharedPool::new(),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn threads(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    /// Set by the controller before releasing the preload phase of a run.
    pub fn set_threads(&self, threads: usize) {
        self.threads.store(threads, Ordering::Release);
    }

    /// The random generator of a worker. Deterministic if the workload has a seed.
    pub fn rng(&self, thread_index: usize) -> SmallRng {
        match self.spec.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(thread_index as u64)),
            None => SmallRng::from_os_rng(),
        }
    }

    /// Count one preloaded key, logging progress every [`LOAD_LOG_INTERVAL`] keys.
    pub(crate) fn key_loaded(&self, expected: u64) {
        let loaded = self.keys_loaded.fetch_add(1, Ordering::AcqRel) + 1;
        if loaded % LOAD_LOG_INTERVAL == 0 {
            info!("Loaded {}/{} entries (on this node)", loaded, expected);
        }
    }
}

/// The strategy of a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicKind {
    PerThread,
    Shared,
    Atomic,
    Bulk { shared: bool },
    ChangingSet,
}

impl LogicKind {
    /// Pick the strategy, rejecting workloads the strategies or the store cannot run.
    pub fn select(spec: &WorkloadSpec, capabilities: Capabilities) -> Result<Self> {
        let invalid = |msg: String| Err(Error::Config(msg));
        if spec.fixed_keys && spec.bytes > 0 {
            return invalid("bytes can be set only with fixed_keys = false".to_string());
        }
        if spec.shared_keys && !spec.fixed_keys {
            return invalid("shared_keys cannot be used with fixed_keys = false".to_string());
        }
        if !spec.fixed_keys {
            if !spec.pool_keys {
                return invalid("keys have to be pooled with fixed_keys = false".to_string());
            }
            if spec.bulk_size != 1 || spec.atomics {
                return invalid(
                    "bulk and atomic operations are not supported with fixed_keys = false"
                        .to_string(),
                );
            }
            if spec.mix.remove > 0 {
                return invalid("remove_perc cannot be set with fixed_keys = false".to_string());
            }
            info!("Using changing set logic");
            return Ok(LogicKind::ChangingSet);
        }
        if spec.bulk_size != 1 {
            if spec.bulk_size as u64 > spec.entries {
                return invalid(format!(
                    "invalid bulk size, must be 1 < bulk_size ({}) <= entries ({})",
                    spec.bulk_size, spec.entries
                ));
            }
            if !capabilities.bulk {
                return invalid("the store does not support bulk operations".to_string());
            }
            info!("Using bulk logic");
            return Ok(LogicKind::Bulk {
                shared: spec.shared_keys,
            });
        }
        if spec.atomics {
            if spec.shared_keys {
                return invalid("atomics on shared keys are not supported".to_string());
            }
            if !capabilities.atomic {
                return invalid("the store does not support atomic operations".to_string());
            }
            if !spec.pool_keys {
                warn!("Keys are not pooled, but last values must be recorded");
            }
            info!("Using fixed set atomic logic");
            return Ok(LogicKind::Atomic);
        }
        if spec.shared_keys {
            info!("Using fixed set shared logic");
            Ok(LogicKind::Shared)
        } else {
            info!("Using fixed set per-thread logic");
            Ok(LogicKind::PerThread)
        }
    }

    /// Create the strategy of one worker.
    pub fn new_logic(
        &self,
        ctx: &Arc<LogicContext>,
        thread_index: usize,
    ) -> Box<dyn OperationLogic> {
        let rng = ctx.rng(thread_index);
        match self {
            LogicKind::PerThread => Box::new(fixed::FixedSetLogic::new(
                fixed::PerThreadKeys::new(ctx.clone()),
                rng,
            )),
            LogicKind::Shared => Box::new(fixed::FixedSetLogic::new(
                fixed::SharedKeys::new(ctx.clone()),
                rng,
            )),
            LogicKind::Atomic => Box::new(atomic::AtomicLogic::new(ctx.clone(), rng)),
            LogicKind::Bulk { shared: false } => Box::new(bulk::BulkLogic::new(
                fixed::PerThreadKeys::new(ctx.clone()),
                rng,
            )),
            LogicKind::Bulk { shared: true } => Box::new(bulk::BulkLogic::new(
                fixed::SharedKeys::new(ctx.clone()),
                rng,
            )),
            LogicKind::ChangingSet => Box::new(changing::ChangingSetLogic::new(ctx.clone(), rng)),
        }
    }
}
