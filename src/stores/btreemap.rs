//! Adapter implementation of [`std::collections::BTreeMap`]. Supports range queries.
//!
//! ## Configuration Format
//!
//! ### [`Mutex`]-based:
//!
//! ``` toml
//! [map]
//! name = "mutex_btreemap"
//! ```
//!
//! ### [`RwLock`]-based:
//! ``` toml
//! [map]
//! name = "rwlock_btreemap"
//! ```

use crate::error::{Result, StoreError};
use crate::stores::Registry;
use crate::*;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type BaseBTreeMap = BTreeMap<Box<[u8]>, Box<[u8]>>;

/// The first `n` entries starting from `key`.
fn range(map: &BaseBTreeMap, key: &[u8], n: usize) -> Vec<(Box<[u8]>, Box<[u8]>)> {
    map.range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
        .take(n)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// {{{ mutex_btreemap

#[derive(Clone, Default)]
pub struct MutexBTreeMap(Arc<Mutex<BaseBTreeMap>>);

impl MutexBTreeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_kvmap(_opt: &toml::Table) -> Result<Arc<dyn KVMap>> {
        Ok(Arc::new(Self::new()))
    }
}

impl KVMap for MutexBTreeMap {
    fn handle(&self) -> Box<dyn KVMapHandle> {
        Box::new(self.clone())
    }

    fn local_size(&self) -> usize {
        self.0.lock().len()
    }

    fn info(&self) -> String {
        "mutex_btreemap".to_string()
    }
}

impl KVMapHandle for MutexBTreeMap {
    fn put(&mut self, _bucket: Option<&str>, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.0.lock().insert(key.into(), value.into());
        Ok(())
    }

    fn get(&mut self, _bucket: Option<&str>, key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(self.0.lock().get(key).cloned())
    }

    fn remove(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
    ) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(self.0.lock().remove(key))
    }

    fn scan(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
        n: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        Ok(range(&self.0.lock(), key, n))
    }
}

inventory::submit! {
    Registry::new("mutex_btreemap", MutexBTreeMap::new_kvmap)
}

// }}} mutex_btreemap

// {{{ rwlock_btreemap

#[derive(Clone, Default)]
pub struct RwLockBTreeMap(Arc<RwLock<BaseBTreeMap>>);

impl RwLockBTreeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_kvmap(_opt: &toml::Table) -> Result<Arc<dyn KVMap>> {
        Ok(Arc::new(Self::new()))
    }
}

impl KVMap for RwLockBTreeMap {
    fn handle(&self) -> Box<dyn KVMapHandle> {
        Box::new(self.clone())
    }

    fn local_size(&self) -> usize {
        self.0.read().len()
    }

    fn info(&self) -> String {
        "rwlock_btreemap".to_string()
    }
}

impl KVMapHandle for RwLockBTreeMap {
    fn put(&mut self, _bucket: Option<&str>, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.0.write().insert(key.into(), value.into());
        Ok(())
    }

    fn get(&mut self, _bucket: Option<&str>, key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(self.0.read().get(key).cloned())
    }

    fn remove(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
    ) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(self.0.write().remove(key))
    }

    fn scan(
        &mut self,
        _bucket: Option<&str>,
        key: &[u8],
        n: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        Ok(range(&self.0.read(), key, n))
    }
}

inventory::submit! {
    Registry::new("rwlock_btreemap", RwLockBTreeMap::new_kvmap)
}

// }}} rwlock_btreemap
