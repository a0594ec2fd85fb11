//! Conditional operations on a per-thread keyspace.
//!
//! The worker remembers the value it last stored for every key. A key without a known value
//! gets a put-if-absent that must insert. Otherwise, by cumulative percentages: write is a
//! put-if-absent that must return the known value, remove is a conditional remove with the
//! known value, remove-invalid and replace-invalid use a stale value the store must refuse, and
//! the rest are replaces of the known value.

use super::fixed::{KeySet, PerThreadKeys};
use super::{LogicContext, OperationLogic};
use crate::stressor::{RequestError, Response, Stressor};
use crate::Request;
use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::Rng;
use std::sync::Arc;

pub struct AtomicLogic {
    keys: PerThreadKeys,
    last_values: HashMap<Box<[u8]>, Box<[u8]>>,
    rng: SmallRng,
}

impl AtomicLogic {
    pub fn new(ctx: Arc<LogicContext>, rng: SmallRng) -> Self {
        let entries = ctx.spec.entries as usize;
        Self {
            keys: PerThreadKeys::new(ctx),
            last_values: HashMap::with_capacity(entries),
            rng,
        }
    }
}

impl OperationLogic for AtomicLogic {
    fn init(&mut self, stressor: &mut Stressor) {
        let last_values = &mut self.last_values;
        self.keys.load(stressor, &mut self.rng, &mut |key, value| {
            last_values.insert(key.into(), value.into());
        });
    }

    fn run(&mut self, stressor: &mut Stressor) -> Result<Response, RequestError> {
        let spec = self.keys.context().spec.clone();
        let action = self.rng.random_range(0..100u32);
        let id = spec.key_dist.next(spec.entries, &mut self.rng);
        let key = self.keys.key(id, stressor.index());
        let new = spec.generate_value(Some(&key), &mut self.rng);

        let last = match self.last_values.get(&key) {
            Some(v) => v.clone(),
            None => {
                self.last_values.insert(key.clone(), new.clone());
                return stressor.make_request(Request::PutIfAbsentIsAbsent { key, value: new });
            }
        };
        let mix = &spec.mix;
        let mut threshold = mix.write as u32;
        if action < threshold {
            return stressor.make_request(Request::PutIfAbsentNotAbsent {
                key,
                value: new,
                expected: last,
            });
        }
        threshold += mix.remove as u32;
        if action < threshold {
            self.last_values.remove(&key);
            return stressor.make_request(Request::RemoveValid {
                key,
                expected: last,
            });
        }
        threshold += mix.remove_invalid as u32;
        if action < threshold {
            let stale = spec.generate_value(Some(&key), &mut self.rng);
            return stressor.make_request(Request::RemoveInvalid {
                key,
                expected: stale,
            });
        }
        threshold += mix.replace_invalid as u32;
        if action < threshold {
            let stale = spec.generate_value(Some(&key), &mut self.rng);
            return stressor.make_request(Request::ReplaceInvalid {
                key,
                old: stale,
                new,
            });
        }
        self.last_values.insert(key.clone(), new.clone());
        stressor.make_request(Request::ReplaceValid { key, old: last, new })
    }
}
