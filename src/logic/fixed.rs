//! Fixed keyspaces.
//!
//! A [`KeySet`] maps key ids in `0..entries` to keys and preloads them. [`PerThreadKeys`] gives
//! every worker its own disjoint range; [`SharedKeys`] gives all workers the same keys, loaded
//! once. [`FixedSetLogic`] reads, writes and removes random keys of a key set.

use super::{LogicContext, OperationLogic};
use crate::stressor::{RequestError, Response, Stressor};
use crate::Request;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Keys of a fixed keyspace.
pub trait KeySet: Send {
    /// Preload the keys. `loaded` is called for every generated entry, whether the put
    /// succeeded or not.
    fn load(
        &mut self,
        stressor: &mut Stressor,
        rng: &mut SmallRng,
        loaded: &mut dyn FnMut(&[u8], &[u8]),
    );

    /// The key with id `id` in `0..entries` for a worker.
    fn key(&self, id: u64, thread_index: usize) -> Box<[u8]>;

    fn context(&self) -> &Arc<LogicContext>;
}

// {{{ per-thread

/// Every worker owns `entries` keys. Worker `t` has key indices `t * entries + i`, or
/// `(node * threads + t) * entries + i` when the node index is set.
pub struct PerThreadKeys {
    ctx: Arc<LogicContext>,
    pooled: Option<Vec<Box<[u8]>>>,
    loaded: u64,
}

impl PerThreadKeys {
    pub fn new(ctx: Arc<LogicContext>) -> Self {
        let pooled = match ctx.spec.pool_keys {
            true => Some(Vec::with_capacity(ctx.spec.entries as usize)),
            false => None,
        };
        Self {
            ctx,
            pooled,
            loaded: 0,
        }
    }

    fn key_index(&self, id: u64, thread_index: usize) -> u64 {
        let entries = self.ctx.spec.entries;
        let slot = match self.ctx.spec.node_index {
            None => thread_index as u64,
            Some(node) => (node * self.ctx.max_threads() + thread_index) as u64,
        };
        slot * entries + id
    }

    fn is_loaded(&self) -> bool {
        let entries = self.ctx.spec.entries;
        match self.pooled {
            Some(ref keys) => keys.len() as u64 == entries,
            None => self.loaded == entries,
        }
    }
}

impl KeySet for PerThreadKeys {
    fn load(
        &mut self,
        stressor: &mut Stressor,
        rng: &mut SmallRng,
        loaded: &mut dyn FnMut(&[u8], &[u8]),
    ) {
        if self.is_loaded() {
            return;
        }
        let spec = self.ctx.spec.clone();
        let expected = spec.entries * self.ctx.threads() as u64;
        let thread_index = stressor.index();
        if let Some(ref mut keys) = self.pooled {
            keys.clear();
        }
        self.loaded = 0;
        for id in 0..spec.entries {
            let key = spec
                .generators
                .key()
                .generate_key(self.key_index(id, thread_index));
            let value = spec.generate_value(Some(&key), rng);
            loaded(&key, &value);
            match stressor.preload(&key, &value) {
                Ok(()) => self.ctx.key_loaded(expected),
                Err(e) => warn!("Failed to insert key {:?}: {}", key, e),
            }
            match self.pooled {
                Some(ref mut keys) => keys.push(key),
                None => self.loaded += 1,
            }
        }
    }

    fn key(&self, id: u64, thread_index: usize) -> Box<[u8]> {
        // a pool that is not loaded yet falls back to the generator
        match self.pooled.as_ref().and_then(|keys| keys.get(id as usize)) {
            Some(key) => key.clone(),
            None => self
                .ctx
                .spec
                .generators
                .key()
                .generate_key(self.key_index(id, thread_index)),
        }
    }

    fn context(&self) -> &Arc<LogicContext> {
        &self.ctx
    }
}

// }}} per-thread

// {{{ shared

/// The key pool of a shared keyspace, built once by worker 0.
pub(crate) struct SharedPool {
    keys: Mutex<Option<Arc<Vec<Box<[u8]>>>>>,
    ready: Condvar,
}

impl SharedPool {
    pub(crate) fn new() -> Self {
        Self {
            keys: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Worker 0 builds the pool if needed, the others wait for it.
    fn get(&self, ctx: &LogicContext, thread_index: usize) -> Arc<Vec<Box<[u8]>>> {
        let entries = ctx.spec.entries;
        let mut keys = self.keys.lock();
        if thread_index == 0 {
            let pool = match *keys {
                Some(ref k) if k.len() as u64 == entries => k.clone(),
                _ => {
                    let kgen = ctx.spec.generators.key();
                    Arc::new((0..entries).map(|i| kgen.generate_key(i)).collect())
                }
            };
            *keys = Some(pool.clone());
            self.ready.notify_all();
            return pool;
        }
        loop {
            if let Some(ref k) = *keys {
                return k.clone();
            }
            self.ready.wait(&mut keys);
        }
    }
}

/// All workers share `entries` keys with indices `0..entries`. The preload is striped over the
/// workers of the first run.
pub struct SharedKeys {
    ctx: Arc<LogicContext>,
    pooled: Option<Arc<Vec<Box<[u8]>>>>,
}

impl SharedKeys {
    pub fn new(ctx: Arc<LogicContext>) -> Self {
        Self { ctx, pooled: None }
    }
}

impl KeySet for SharedKeys {
    fn load(
        &mut self,
        stressor: &mut Stressor,
        rng: &mut SmallRng,
        loaded: &mut dyn FnMut(&[u8], &[u8]),
    ) {
        let thread_index = stressor.index();
        if self.ctx.spec.pool_keys {
            self.pooled = Some(self.ctx.pool.get(&self.ctx, thread_index));
        }
        let entries = self.ctx.spec.entries;
        let stride = self.ctx.threads().max(1);
        if thread_index == 0 {
            info!(
                "We have loaded {} keys, expecting {} locally loaded, {} in store",
                self.ctx.keys_loaded.load(Ordering::Acquire),
                entries,
                self.ctx.map.local_size()
            );
        }
        if self.ctx.keys_loaded.load(Ordering::Acquire) >= entries {
            return;
        }
        let spec = self.ctx.spec.clone();
        for id in (thread_index as u64..entries).step_by(stride) {
            let key = self.key(id, thread_index);
            let value = spec.generate_value(Some(&key), rng);
            loaded(&key, &value);
            match stressor.preload(&key, &value) {
                Ok(()) => self.ctx.key_loaded(entries),
                Err(e) => error!("Failed to insert shared key {}: {}", id, e),
            }
        }
    }

    fn key(&self, id: u64, _thread_index: usize) -> Box<[u8]> {
        match self.pooled.as_ref().and_then(|keys| keys.get(id as usize)) {
            Some(key) => key.clone(),
            None => self.ctx.spec.generators.key().generate_key(id),
        }
    }

    fn context(&self) -> &Arc<LogicContext> {
        &self.ctx
    }
}

// }}} shared

/// Random reads, writes and removes on a fixed keyspace.
pub struct FixedSetLogic<K: KeySet> {
    keys: K,
    rng: SmallRng,
}

impl<K: KeySet> FixedSetLogic<K> {
    pub fn new(keys: K, rng: SmallRng) -> Self {
        Self { keys, rng }
    }
}

impl<K: KeySet> OperationLogic for FixedSetLogic<K> {
    fn init(&mut self, stressor: &mut Stressor) {
        self.keys.load(stressor, &mut self.rng, &mut |_, _| {});
    }

    fn run(&mut self, stressor: &mut Stressor) -> Result<Response, RequestError> {
        let spec = self.keys.context().spec.clone();
        let action = self.rng.random_range(0..100u8);
        let id = spec.key_dist.next(spec.entries, &mut self.rng);
        let key = self.keys.key(id, stressor.index());
        let request = if action < spec.mix.write {
            let value = spec.generate_value(Some(&key), &mut self.rng);
            Request::Put { key, value }
        } else if action < spec.mix.write + spec.mix.remove {
            Request::Remove { key }
        } else {
            Request::Get { key }
        };
        stressor.make_request(request)
    }
}
