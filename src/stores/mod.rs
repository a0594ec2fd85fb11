//! Built-in key-value stores, and the registry of all stores.
//!
//! ## Configuration Format
//!
//! The configuration of a key-value store is stored in a dictionary named `map`. Therefore, a
//! store's configuration file looks like the following:
//!
//! ```toml
//! [map]
//! name = "..."
//! # option1 = ...
//! # option2 = ...
//! ```
//! The field `name` must be given and it should be equal to the name registered by the store.
//! Other than `name`, all the fields are parsed as a table and handed over to the constructor
//! of the store. For available options, refer to the module-level documentation of a specific
//! store.
//!
//! The built-in stores live in memory and have a single keyspace: the bucket of a request is
//! accepted and ignored.
//!
//! ## Registering New Stores
//!
//! To stress a store from another crate, implement [`KVMap`]/[`KVMapHandle`] for it (and
//! [`crate::AtomicKVMapHandle`]/[`crate::BulkKVMapHandle`] if it has them), then write a
//! constructor function with a signature of `fn(&toml::Table) -> Result<Arc<dyn KVMap>>`.
//!
//! The final step is to register the store's constructor (along with its name) using
//! [`inventory`]. A minimal example would be: `inventory::submit! { Registry::new("name",
//! constructor_fn) };`.

use crate::error::{Error, Result};
use crate::KVMap;
use hashbrown::HashMap;
use log::debug;
use rustc_hash::FxHasher;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::hash::Hasher;
use std::sync::Arc;
use toml::Table;

/// The shard of `key` among `nr_shards`.
pub fn shard(key: &[u8], nr_shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    (hasher.finish() % nr_shards as u64) as usize
}

/// Parse the options of a store, naming the store in the error.
pub(crate) fn parse_opt<T: DeserializeOwned>(name: &str, opt: &Table) -> Result<T> {
    opt.clone()
        .try_into()
        .map_err(|e| Error::Config(format!("invalid options of store {}: {}", name, e)))
}

pub type StoreFn = fn(&Table) -> Result<Arc<dyn KVMap>>;

/// The centralized registry that maps the name of a key-value store to its constructor
/// function.
///
/// A user-defined store can use the [`inventory::submit!`] macro to register itself.
pub struct Registry<'a> {
    pub(crate) name: &'a str,
    constructor: StoreFn,
}

impl<'a> Registry<'a> {
    pub const fn new(name: &'a str, constructor: StoreFn) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry<'static>);

/// Names of all registered stores, sorted.
pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = inventory::iter::<Registry>
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort_unstable();
    names
}

/// The `[map]` table: a store name and its options.
#[derive(Deserialize, Clone, Debug)]
pub struct StoreOpt {
    pub name: String,
    #[serde(flatten)]
    pub opt: Table,
}

/// Create the store named by `opt`.
pub fn new_map(opt: &StoreOpt) -> Result<Arc<dyn KVMap>> {
    let mut registered: HashMap<&'static str, StoreFn> = HashMap::new();
    for r in inventory::iter::<Registry> {
        debug!("Adding supported kvmap: {}", r.name);
        assert!(registered.insert(r.name, r.constructor).is_none()); // no existing name
    }
    let f = registered
        .get(opt.name.as_str())
        .ok_or_else(|| Error::UnknownStore(opt.name.clone()))?;
    f(&opt.opt)
}

pub mod btreemap;
pub mod hashmap;
pub mod null;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn map_test(map: &dyn KVMap) {
        let mut handle = map.handle();
        // insert + get
        handle.put(None, b"foo", b"bar").unwrap();
        assert_eq!(handle.get(None, b"foo").unwrap(), Some((*b"bar").into()));
        assert_eq!(handle.get(None, b"f00").unwrap(), None);
        assert_eq!(map.local_size(), 1);

        // update
        handle.put(None, b"foo", b"0ar").unwrap();
        assert_eq!(handle.get(None, b"foo").unwrap(), Some((*b"0ar").into()));

        // remove
        assert_eq!(handle.remove(None, b"foo").unwrap(), Some((*b"0ar").into()));
        assert_eq!(handle.get(None, b"foo").unwrap(), None);
        assert_eq!(handle.remove(None, b"foo").unwrap(), None);
        assert_eq!(map.local_size(), 0);
    }

    fn atomic_test(map: &dyn KVMap) {
        assert!(map.capabilities().atomic);
        let mut handle = map.handle();
        let atomic = handle.atomic().unwrap();
        assert_eq!(atomic.put_if_absent(None, b"k", b"1").unwrap(), None);
        assert_eq!(
            atomic.put_if_absent(None, b"k", b"2").unwrap(),
            Some((*b"1").into())
        );
        assert!(!atomic.replace(None, b"k", b"2", b"3").unwrap());
        assert!(atomic.replace(None, b"k", b"1", b"3").unwrap());
        assert!(!atomic.remove_if(None, b"k", b"1").unwrap());
        assert!(atomic.remove_if(None, b"k", b"3").unwrap());
        assert!(!atomic.replace(None, b"k", b"3", b"4").unwrap());
        assert_eq!(map.local_size(), 0);
    }

    fn bulk_test(map: &dyn KVMap) {
        assert!(map.capabilities().bulk);
        let mut handle = map.handle();
        let bulk = handle.bulk().unwrap();
        let entries: Vec<(Box<[u8]>, Box<[u8]>)> = (0..10u8)
            .map(|i| (vec![i].into_boxed_slice(), vec![i, i].into_boxed_slice()))
            .collect();
        let keys: Vec<Box<[u8]>> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(bulk.put_all(None, &entries, false).unwrap().unwrap().len(), 0);
        assert_eq!(map.local_size(), 10);
        let got = bulk.get_all(None, &keys, true).unwrap().unwrap();
        assert_eq!(got.len(), 10);
        assert_eq!(&got[&keys[3]][..], &[3u8, 3][..]);
        assert_eq!(bulk.remove_all(None, &keys[..4], false).unwrap().unwrap().len(), 4);
        assert_eq!(map.local_size(), 6);
        assert_eq!(bulk.get_all(None, &keys, false).unwrap().unwrap().len(), 6);
    }

    fn store(name: &str) -> Arc<dyn KVMap> {
        let opt: StoreOpt = toml::from_str(&format!("name = \"{}\"", name)).unwrap();
        new_map(&opt).unwrap()
    }

    #[test]
    fn nullmap() {
        let map = store("nullmap");
        let mut handle = map.handle();
        handle.put(None, b"foo", b"bar").unwrap();
        assert!(handle.get(None, b"foo").unwrap().is_none());
        assert_eq!(map.local_size(), 0);
        assert_eq!(map.capabilities(), crate::Capabilities::default());
    }

    #[test]
    fn mutex_hashmap() {
        let map = store("mutex_hashmap");
        map_test(map.as_ref());
        atomic_test(map.as_ref());
        bulk_test(map.as_ref());
    }

    #[test]
    fn rwlock_hashmap() {
        let opt: StoreOpt = toml::from_str("name = \"rwlock_hashmap\"\nshards = 7").unwrap();
        let map = new_map(&opt).unwrap();
        map_test(map.as_ref());
        atomic_test(map.as_ref());
        bulk_test(map.as_ref());
    }

    #[test]
    fn mutex_btreemap() {
        map_test(store("mutex_btreemap").as_ref());
    }

    #[test]
    fn rwlock_btreemap() {
        map_test(store("rwlock_btreemap").as_ref());
    }

    #[test]
    fn btreemap_scan() {
        let map = store("mutex_btreemap");
        let mut handle = map.handle();
        for k in [b"a", b"c", b"e", b"g"] {
            handle.put(None, k, b"v").unwrap();
        }
        let range = handle.scan(None, b"b", 2).unwrap();
        let keys: Vec<&[u8]> = range.iter().map(|(k, _)| &k[..]).collect();
        assert_eq!(keys, vec![&b"c"[..], &b"e"[..]]);
        assert_eq!(handle.scan(None, b"z", 2).unwrap().len(), 0);
        assert!(handle.atomic().is_none());
    }

    #[test]
    fn hashmap_has_no_scan() {
        let map = store("mutex_hashmap");
        assert_eq!(
            map.handle().scan(None, b"a", 1),
            Err(StoreError::Unsupported("scan"))
        );
    }

    #[test]
    fn unknown_store() {
        let opt: StoreOpt = toml::from_str("name = \"nonexistent\"").unwrap();
        assert!(matches!(new_map(&opt), Err(Error::UnknownStore(n)) if n == "nonexistent"));
    }

    #[test]
    fn invalid_options() {
        let opt: StoreOpt = toml::from_str("name = \"mutex_hashmap\"\nshards = \"many\"").unwrap();
        assert!(matches!(new_map(&opt), Err(Error::Config(_))));
        let opt: StoreOpt = toml::from_str("name = \"mutex_hashmap\"\nshards = 0").unwrap();
        assert!(matches!(new_map(&opt), Err(Error::Config(_))));
    }

    #[test]
    fn registered_names() {
        let names = names();
        for n in [
            "mutex_btreemap",
            "mutex_hashmap",
            "nullmap",
            "rwlock_btreemap",
            "rwlock_hashmap",
        ] {
            assert!(names.contains(&n));
        }
    }

    #[test]
    fn shards_are_in_range() {
        for i in 0..1000u32 {
            assert!(shard(&i.to_be_bytes(), 7) < 7);
        }
        assert_eq!(shard(b"foo", 7), shard(b"foo", 7));
    }
}
