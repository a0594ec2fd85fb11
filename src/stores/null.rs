//! A store that keeps nothing. It can be used to measure the overhead of the harness itself.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [map]
//! name = "nullmap"
//! ```

use crate::error::{Result, StoreError};
use crate::stores::Registry;
use crate::*;
use std::sync::Arc;

/// NullMap does nothing: puts succeed, gets and removes find nothing.
#[derive(Clone, Default)]
pub struct NullMap;

impl NullMap {
    pub fn new() -> Self {
        Self
    }

    pub fn new_kvmap(_opt: &toml::Table) -> Result<Arc<dyn KVMap>> {
        Ok(Arc::new(Self::new()))
    }
}

impl KVMap for NullMap {
    fn handle(&self) -> Box<dyn KVMapHandle> {
        Box::new(self.clone())
    }

    fn local_size(&self) -> usize {
        0
    }

    fn info(&self) -> String {
        "nullmap".to_string()
    }
}

impl KVMapHandle for NullMap {
    fn put(&mut self, _bucket: Option<&str>, _key: &[u8], _value: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&mut self, _bucket: Option<&str>, _key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(None)
    }

    fn remove(
        &mut self,
        _bucket: Option<&str>,
        _key: &[u8],
    ) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(None)
    }
}

inventory::submit! {
    Registry::new("nullmap", NullMap::new_kvmap)
}
