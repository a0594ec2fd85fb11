//! Adapter implementation of [`hashbrown::HashMap`]. Internally sharded.
//!
//! Both variants support conditional and bulk operations. A conditional operation holds the
//! lock of the key's shard throughout, so it is atomic. A bulk operation locks one shard at a
//! time and is not; `prefer_async` makes no difference.
//!
//! ## Configuration Format
//!
//! ### [`Mutex`]-based:
//!
//! ``` toml
//! [map]
//! name = "mutex_hashmap"
//! shards = ... # number of shards, 512 by default
//! ```
//!
//! ### [`RwLock`]-based:
//! ``` toml
//! [map]
//! name = "rwlock_hashmap"
//! shards = ... # number of shards, 512 by default
//! ```

use crate::error::{Error, Result, StoreError};
use crate::stores::{parse_opt, shard, Registry};
use crate::*;
use ::hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_SHARDS: usize = 512;

/// A raw [`HashMap`] with variable-sized keys and values.
///
/// It is used as the building block of other types. Note that this is not [`KVMap`].
pub type BaseHashMap = HashMap<Box<[u8]>, Box<[u8]>>;

#[derive(Deserialize)]
pub struct HashMapOpt {
    pub shards: Option<usize>,
}

impl HashMapOpt {
    fn shards(&self) -> Result<usize> {
        match self.shards.unwrap_or(DEFAULT_SHARDS) {
            0 => Err(Error::Config("shards should be positive".to_string())),
            n => Ok(n),
        }
    }
}

/// Lock-protected shards. Implemented by both sharded maps so that they share one handle.
trait Shards: Clone + Send + Sync + 'static {
    fn nr_shards(&self) -> usize;

    fn read<R>(&self, sid: usize, f: impl FnOnce(&BaseHashMap) -> R) -> R;

    fn write<R>(&self, sid: usize, f: impl FnOnce(&mut BaseHashMap) -> R) -> R;

    fn sid(&self, key: &[u8]) -> usize {
        shard(key, self.nr_shards())
    }

    fn len(&self) -> usize {
        (0..self.nr_shards()).map(|sid| self.read(sid, |m| m.len())).sum()
    }
}

/// The handle of a sharded map: a clone of the map itself.
struct ShardsHandle<S: Shards>(S);

impl<S: Shards> KVMapHandle for ShardsHandle<S> {
    fn put(&mut self, _bucket: Option<&str>, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let sid = self.0.sid(key);
        self.0.write(sid, |m| m.insert(key.into(), value.into()));
        Ok(())
    }

    fn get(&mut self, _bucket: Option<&str>, key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError> {
        let sid = self.0.sid(key);
        Ok(self.0.read(sid, |m| m.get(key).cloned()))
    }

    fn remove(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
    ) -> Result<Option<Box<[u8]>>, StoreError> {
        let sid = self.0.sid(key);
        Ok(self.0.write(sid, |m| m.remove(key)))
    }

    fn atomic(&mut self) -> Option<&mut dyn AtomicKVMapHandle> {
        Some(self)
    }

    fn bulk(&mut self) -> Option<&mut dyn BulkKVMapHandle> {
        Some(self)
    }
}

impl<S: Shards> AtomicKVMapHandle for ShardsHandle<S> {
    fn replace(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
        old: &[u8],
        new: &[u8],
    ) -> Result<bool, StoreError> {
        let sid = self.0.sid(key);
        Ok(self.0.write(sid, |m| match m.get_mut(key) {
            Some(v) if &v[..] == old => {
                *v = new.into();
                true
            }
            _ => false,
        }))
    }

    fn put_if_absent(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Box<[u8]>>, StoreError> {
        let sid = self.0.sid(key);
        Ok(self.0.write(sid, |m| match m.get(key) {
            Some(v) => Some(v.clone()),
            None => {
                m.insert(key.into(), value.into());
                None
            }
        }))
    }

    fn remove_if(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
        old: &[u8],
    ) -> Result<bool, StoreError> {
        let sid = self.0.sid(key);
        Ok(self.0.write(sid, |m| {
            if m.get(key).is_some_and(|v| &v[..] == old) {
                m.remove(key);
                true
            } else {
                false
            }
        }))
    }
}

impl<S: Shards> BulkKVMapHandle for ShardsHandle<S> {
    fn get_all(
        &mut self,
        _bucket: Option<&str>,
        keys: &[Box<[u8]>],
        _prefer_async: bool,
    ) -> Result<BulkResult, StoreError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let sid = self.0.sid(key);
            if let Some(v) = self.0.read(sid, |m| m.get(key).cloned()) {
                found.insert(key.clone(), v);
            }
        }
        Ok(Some(found))
    }

    fn put_all(
        &mut self,
        _bucket: Option<&str>,
        entries: &[(Box<[u8]>, Box<[u8]>)],
        _prefer_async: bool,
    ) -> Result<BulkResult, StoreError> {
        let mut previous = HashMap::new();
        for (key, value) in entries {
            let sid = self.0.sid(key);
            if let Some(v) = self.0.write(sid, |m| m.insert(key.clone(), value.clone())) {
                previous.insert(key.clone(), v);
            }
        }
        Ok(Some(previous))
    }

    fn remove_all(
        &mut self,
        _bucket: Option<&str>,
        keys: &[Box<[u8]>],
        _prefer_async: bool,
    ) -> Result<BulkResult, StoreError> {
        let mut removed = HashMap::with_capacity(keys.len());
        for key in keys {
            let sid = self.0.sid(key);
            if let Some(v) = self.0.write(sid, |m| m.remove(key)) {
                removed.insert(key.clone(), v);
            }
        }
        Ok(Some(removed))
    }
}

const CAPABILITIES: Capabilities = Capabilities {
    atomic: true,
    bulk: true,
};

// {{{ mutex_hashmap

#[derive(Clone)]
pub struct MutexHashMap {
    shards: Arc<Vec<Mutex<BaseHashMap>>>,
}

impl MutexHashMap {
    pub fn with_shards(nr_shards: usize) -> Self {
        let shards = (0..nr_shards)
            .map(|_| Mutex::new(BaseHashMap::new()))
            .collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    pub fn new(opt: &HashMapOpt) -> Result<Self> {
        Ok(Self::with_shards(opt.shards()?))
    }

    pub fn new_kvmap(opt: &toml::Table) -> Result<Arc<dyn KVMap>> {
        let opt: HashMapOpt = parse_opt("mutex_hashmap", opt)?;
        Ok(Arc::new(Self::new(&opt)?))
    }
}

impl Shards for MutexHashMap {
    fn nr_shards(&self) -> usize {
        self.shards.len()
    }

    fn read<R>(&self, sid: usize, f: impl FnOnce(&BaseHashMap) -> R) -> R {
        f(&self.shards[sid].lock())
    }

    fn write<R>(&self, sid: usize, f: impl FnOnce(&mut BaseHashMap) -> R) -> R {
        f(&mut self.shards[sid].lock())
    }
}

impl KVMap for MutexHashMap {
    fn handle(&self) -> Box<dyn KVMapHandle> {
        Box::new(ShardsHandle(self.clone()))
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn local_size(&self) -> usize {
        self.len()
    }

    fn info(&self) -> String {
        format!("mutex_hashmap with {} shards", self.nr_shards())
    }
}

inventory::submit! {
    Registry::new("mutex_hashmap", MutexHashMap::new_kvmap)
}

// }}} mutex_hashmap

// {{{ rwlock_hashmap

#[derive(Clone)]
pub struct RwLockHashMap {
    shards: Arc<Vec<RwLock<BaseHashMap>>>,
}

impl RwLockHashMap {
    pub fn with_shards(nr_shards: usize) -> Self {
        let shards = (0..nr_shards)
            .map(|_| RwLock::new(BaseHashMap::new()))
            .collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    pub fn new(opt: &HashMapOpt) -> Result<Self> {
        Ok(Self::with_shards(opt.shards()?))
    }

    pub fn new_kvmap(opt: &toml::Table) -> Result<Arc<dyn KVMap>> {
        let opt: HashMapOpt = parse_opt("rwlock_hashmap", opt)?;
        Ok(Arc::new(Self::new(&opt)?))
    }
}

impl Shards for RwLockHashMap {
    fn nr_shards(&self) -> usize {
        self.shards.len()
    }

    fn read<R>(&self, sid: usize, f: impl FnOnce(&BaseHashMap) -> R) -> R {
        f(&self.shards[sid].read())
    }

    fn write<R>(&self, sid: usize, f: impl FnOnce(&mut BaseHashMap) -> R) -> R {
        f(&mut self.shards[sid].write())
    }
}

impl KVMap for RwLockHashMap {
    fn handle(&self) -> Box<dyn KVMapHandle> {
        Box::new(ShardsHandle(self.clone()))
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn local_size(&self) -> usize {
        self.len()
    }

    fn info(&self) -> String {
        format!("rwlock_hashmap with {} shards", self.nr_shards())
    }
}

inventory::submit! {
    Registry::new("rwlock_hashmap", RwLockHashMap::new_kvmap)
}

// }}} rwlock_hashmap
