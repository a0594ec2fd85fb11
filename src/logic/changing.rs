//! A keyspace that changes over time.
//!
//! Entries are inserted with a scheduled removal time and removed once it has passed. Values
//! are grouped by size class; every class has a bound on its live entries, derived from
//! `entries` or from the `bytes` budget and the entry size distribution. A request is, in this
//! order of precedence:
//!
//! 1. the removal of the entry scheduled earliest, if that time has passed,
//! 2. with probability `100 - write_perc` percent, a get of a live entry,
//! 3. a put: a new key if the size class of the new value is below its bound, otherwise an
//!    overwrite of a live entry.
//!
//! Removal times are `now + r * r + jitter` with `r` uniform below the square root of the
//! lifespan, so short lifespans are much more likely than long ones.

use super::{LogicContext, OperationLogic};
use crate::stressor::{RequestError, Response, Stressor};
use crate::Request;
use hashbrown::HashMap;
use log::{error, info, warn};
use quanta::Instant;
use rand::rngs::SmallRng;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Attempts to find a size class with live entries before giving up on a get.
const SIZE_CLASS_ATTEMPTS: usize = 100;

/// Attempts to remove a key whose overwrite failed.
const REMOVE_ATTEMPTS: usize = 100;

/// A live key and when it is due for removal, in ms. Ordered by time, then by key, so distinct
/// keys due at the same time are distinct set members.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledKey {
    pub remove_at: u64,
    pub key: Box<[u8]>,
}

/// The live entries of one size class.
#[derive(Debug)]
pub struct SizeBucket {
    pub max: u64,
    pub scheduled: BTreeSet<ScheduledKey>,
}

impl SizeBucket {
    fn new(max: u64) -> Self {
        Self {
            max,
            scheduled: BTreeSet::new(),
        }
    }

    /// The latest entry due at or before `target`, or the earliest one if there is none.
    fn near(&self, target: u64) -> Option<&ScheduledKey> {
        let bound = ScheduledKey {
            remove_at: target.saturating_add(1),
            key: Box::new([]),
        };
        self.scheduled
            .range(..bound)
            .next_back()
            .or_else(|| self.scheduled.first())
    }
}

/// A random removal time after `now`, for entries living at most about `lifespan` ms.
fn random_timestamp(rng: &mut SmallRng, now: u64, lifespan: u64) -> u64 {
    let max_root = ((lifespan as f64).sqrt() as u64).max(2);
    let r = rng.random_range(0..max_root);
    let jitter = rng.random_range(1..2 * max_root - 1);
    now + r * r + jitter
}

pub struct ChangingSetLogic {
    ctx: Arc<LogicContext>,
    rng: SmallRng,
    origin: Instant,
    /// Earliest removal time over all size classes, `u64::MAX` if there are no entries.
    min_remove_at: u64,
    min_remove_size: usize,
    buckets: HashMap<usize, SizeBucket>,
}

impl ChangingSetLogic {
    pub fn new(ctx: Arc<LogicContext>, rng: SmallRng) -> Self {
        Self {
            ctx,
            rng,
            origin: Instant::now(),
            min_remove_at: u64::MAX,
            min_remove_size: 0,
            buckets: HashMap::new(),
        }
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn buckets(&self) -> &HashMap<usize, SizeBucket> {
        &self.buckets
    }

    fn lifespan(&self) -> u64 {
        self.ctx.spec.entry_lifespan.as_millis() as u64
    }

    fn update_min(&mut self) {
        self.min_remove_at = u64::MAX;
        for (size, bucket) in self.buckets.iter() {
            if let Some(first) = bucket.scheduled.first() {
                if first.remove_at < self.min_remove_at {
                    self.min_remove_at = first.remove_at;
                    self.min_remove_size = *size;
                }
            }
        }
    }

    fn expire(&mut self, stressor: &mut Stressor) -> Result<Response, RequestError> {
        let size = self.min_remove_size;
        let Some(scheduled) = self
            .buckets
            .get_mut(&size)
            .and_then(|b| b.scheduled.pop_first())
        else {
            self.update_min();
            return Ok(Response::Empty);
        };
        let response = match stressor.make_request(Request::Remove {
            key: scheduled.key.clone(),
        }) {
            Ok(r) => r,
            Err(e) => {
                // retried with the next request
                if let Some(b) = self.buckets.get_mut(&size) {
                    b.scheduled.insert(scheduled);
                }
                return Err(e);
            }
        };
        self.update_min();
        if response.is_empty() && !self.ctx.spec.expect_lost_keys {
            error!("REMOVE: Value for key {:?} is null", scheduled.key);
        }
        Ok(response)
    }

    fn get(&mut self, stressor: &mut Stressor, now: u64) -> Result<Response, RequestError> {
        let spec = self.ctx.spec.clone();
        let mut size = spec.entry_size.next(&mut self.rng);
        for _ in 1..SIZE_CLASS_ATTEMPTS {
            if self
                .buckets
                .get(&size)
                .is_some_and(|b| !b.scheduled.is_empty())
            {
                break;
            }
            size = spec.entry_size.next(&mut self.rng);
        }
        let lifespan = self.lifespan();
        let target = random_timestamp(&mut self.rng, now, lifespan);
        let Some(scheduled) = self.buckets.get(&size).and_then(|b| b.near(target)).cloned()
        else {
            error!(
                "Current load seems to be empty but the earliest removal is at {}",
                self.min_remove_at
            );
            return Ok(Response::Empty);
        };
        let response = stressor.make_request(Request::Get {
            key: scheduled.key.clone(),
        })?;
        if response.is_empty() {
            if spec.expect_lost_keys {
                if let Some(b) = self.buckets.get_mut(&size) {
                    b.scheduled.remove(&scheduled);
                }
                self.update_min();
            } else {
                error!("GET: Value for key {:?} is null", scheduled.key);
            }
        }
        Ok(response)
    }

    fn put(&mut self, stressor: &mut Stressor, now: u64) -> Result<Response, RequestError> {
        let spec = self.ctx.spec.clone();
        let value = spec.generate_value(None, &mut self.rng);
        let size = spec.generators.value().size_of(&value);
        let lifespan = self.lifespan();
        let Some(bucket) = self.buckets.get_mut(&size) else {
            warn!("Value of size {} has no size class", size);
            return Ok(Response::Empty);
        };
        let scheduled = if (bucket.scheduled.len() as u64) < bucket.max {
            let index = self
                .ctx
                .keys_loaded
                .fetch_add(spec.num_nodes as u64, Ordering::AcqRel);
            let scheduled = ScheduledKey {
                remove_at: random_timestamp(&mut self.rng, now, lifespan),
                key: spec.generators.key().generate_key(index),
            };
            bucket.scheduled.insert(scheduled.clone());
            self.update_min();
            scheduled
        } else {
            let target = random_timestamp(&mut self.rng, now, lifespan);
            match bucket.near(target) {
                Some(s) => s.clone(),
                // a size class without room
                None => return Ok(Response::Empty),
            }
        };
        let key = scheduled.key.clone();
        match stressor.make_request(Request::Put {
            key: key.clone(),
            value,
        }) {
            Ok(r) => Ok(r),
            Err(e) => {
                if let Some(b) = self.buckets.get_mut(&size) {
                    b.scheduled.remove(&scheduled);
                }
                self.update_min();
                for _ in 0..REMOVE_ATTEMPTS {
                    if let Ok(r) = stressor.make_request(Request::Remove { key: key.clone() }) {
                        return Ok(r);
                    }
                }
                error!(
                    "Failed to remove key {:?} after {} attempts",
                    key, REMOVE_ATTEMPTS
                );
                Err(e)
            }
        }
    }
}

impl OperationLogic for ChangingSetLogic {
    fn init(&mut self, _stressor: &mut Stressor) {
        if !self.buckets.is_empty() {
            return;
        }
        let spec = self.ctx.spec.clone();
        let _ = self.ctx.keys_loaded.compare_exchange(
            0,
            spec.node_index.unwrap_or(0) as u64,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let entries = match spec.bytes {
            0 => spec.entries,
            bytes => (bytes as f64 / spec.entry_size.average()) as u64,
        };
        let mut expected_max = 0u64;
        for (size, probability) in spec.entry_size.probabilities() {
            let max = (entries as f64 * probability) as u64;
            expected_max += max * size as u64;
            self.buckets.insert(size, SizeBucket::new(max));
        }
        info!("Expecting maximal load of {} bytes", expected_max);
    }

    fn run(&mut self, stressor: &mut Stressor) -> Result<Response, RequestError> {
        let now = self.now();
        if self.min_remove_at <= now {
            self.expire(stressor)
        } else if self.rng.random_range(0..100u8) >= self.ctx.spec.mix.write
            && self.min_remove_at < u64::MAX
        {
            self.get(stressor, now)
        } else {
            self.put(stressor, now)
        }
    }
}
