//! Key and value generators.
//!
//! A key generator deterministically maps an index to a key; workloads derive all their keys
//! from indices. A value generator produces a value of a requested size for a key.
//!
//! ## Configuration Format
//!
//! ```toml
//! key_generator = "string"   # "string" (default) or "bytes"
//! key_generator_param = "k"  # optional, generator specific
//! value_generator = "random" # "random" (default) or "zeros"
//! ```
//!
//! - `string`: keys are `<prefix><index>` in ASCII. The param is the prefix, `key_` by default.
//! - `bytes`: keys are the big-endian index padded with zeros to a fixed length. The param is
//! the length, 8 by default.
//! - `random`: values are random bytes.
//! - `zeros`: values are zero-filled. Values of equal size are then indistinguishable, so
//! conditional operations expecting a mismatch will not see one.
//!
//! ## Registering New Generators
//!
//! Like stores, generators are registered with [`inventory`]:
//! `inventory::submit! { KeyGeneratorRegistry::new("name", constructor_fn) };` where the
//! constructor has the signature `fn(Option<&str>) -> Box<dyn KeyGenerator>` and receives the
//! configured param.

use crate::error::{Error, Result};
use log::{info, warn};
use rand::RngCore;
use std::fmt;
use std::sync::OnceLock;

/// Maps indices to keys. Called concurrently from all workers.
pub trait KeyGenerator: Send + Sync {
    /// Must return the same key for the same index, and different keys for different indices.
    fn generate_key(&self, index: u64) -> Box<[u8]>;
}

/// Produces values. Called concurrently from all workers.
pub trait ValueGenerator: Send + Sync {
    /// A value of `size` bytes. `key` is `None` when the key is not known yet.
    fn generate_value(&self, key: Option<&[u8]>, size: usize, rng: &mut dyn RngCore)
        -> Box<[u8]>;

    /// The size class of a value produced by this generator.
    fn size_of(&self, value: &[u8]) -> usize;

    /// Whether `value` could have been produced by this generator with `expected_size`. An
    /// expected size of `0` accepts any size.
    fn check_value(&self, value: &[u8], expected_size: usize) -> bool;
}

pub type KeyGeneratorFn = fn(Option<&str>) -> Box<dyn KeyGenerator>;
pub type ValueGeneratorFn = fn(Option<&str>) -> Box<dyn ValueGenerator>;

/// Registry entry of a key generator.
pub struct KeyGeneratorRegistry<'a> {
    pub(crate) name: &'a str,
    constructor: KeyGeneratorFn,
}

impl<'a> KeyGeneratorRegistry<'a> {
    pub const fn new(name: &'a str, constructor: KeyGeneratorFn) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(KeyGeneratorRegistry<'static>);

/// Registry entry of a value generator.
pub struct ValueGeneratorRegistry<'a> {
    pub(crate) name: &'a str,
    constructor: ValueGeneratorFn,
}

impl<'a> ValueGeneratorRegistry<'a> {
    pub const fn new(name: &'a str, constructor: ValueGeneratorFn) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(ValueGeneratorRegistry<'static>);

// {{{ generators

/// Resolved but not yet instantiated generators of a run. Each generator is created on first
/// use and then shared by all workers.
pub struct Generators {
    key_name: String,
    key_param: Option<String>,
    key_constructor: KeyGeneratorFn,
    key: OnceLock<Box<dyn KeyGenerator>>,
    value_name: String,
    value_param: Option<String>,
    value_constructor: ValueGeneratorFn,
    value: OnceLock<Box<dyn ValueGenerator>>,
}

impl Generators {
    /// Look up both generators in the registries.
    pub fn resolve(
        key_name: &str,
        key_param: Option<String>,
        value_name: &str,
        value_param: Option<String>,
    ) -> Result<Self> {
        let key_constructor = inventory::iter::<KeyGeneratorRegistry>
            .into_iter()
            .find(|r| r.name == key_name)
            .map(|r| r.constructor)
            .ok_or_else(|| Error::UnknownGenerator {
                kind: "key",
                name: key_name.to_string(),
            })?;
        let value_constructor = inventory::iter::<ValueGeneratorRegistry>
            .into_iter()
            .find(|r| r.name == value_name)
            .map(|r| r.constructor)
            .ok_or_else(|| Error::UnknownGenerator {
                kind: "value",
                name: value_name.to_string(),
            })?;
        Ok(Self {
            key_name: key_name.to_string(),
            key_param,
            key_constructor,
            key: OnceLock::new(),
            value_name: value_name.to_string(),
            value_param,
            value_constructor,
            value: OnceLock::new(),
        })
    }

    pub fn key(&self) -> &dyn KeyGenerator {
        self.key
            .get_or_init(|| {
                info!(
                    "Using key generator {}, param {:?}",
                    self.key_name, self.key_param
                );
                (self.key_constructor)(self.key_param.as_deref())
            })
            .as_ref()
    }

    pub fn value(&self) -> &dyn ValueGenerator {
        self.value
            .get_or_init(|| {
                info!(
                    "Using value generator {}, param {:?}",
                    self.value_name, self.value_param
                );
                (self.value_constructor)(self.value_param.as_deref())
            })
            .as_ref()
    }
}

impl fmt::Debug for Generators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generators")
            .field("key", &self.key_name)
            .field("key_param", &self.key_param)
            .field("value", &self.value_name)
            .field("value_param", &self.value_param)
            .finish()
    }
}

// }}} generators

// {{{ string

/// ASCII keys `<prefix><index>`.
pub struct StringKeyGenerator {
    prefix: String,
}

impl StringKeyGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn new_key_generator(param: Option<&str>) -> Box<dyn KeyGenerator> {
        Box::new(Self::new(param.unwrap_or("key_")))
    }
}

impl KeyGenerator for StringKeyGenerator {
    fn generate_key(&self, index: u64) -> Box<[u8]> {
        format!("{}{}", self.prefix, index).into_bytes().into_boxed_slice()
    }
}

inventory::submit! {
    KeyGeneratorRegistry::new("string", StringKeyGenerator::new_key_generator)
}

// }}} string

// {{{ bytes

/// Fixed-length binary keys holding the big-endian index.
pub struct BytesKeyGenerator {
    len: usize,
}

impl BytesKeyGenerator {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "key length should be positive");
        Self { len }
    }

    pub fn new_key_generator(param: Option<&str>) -> Box<dyn KeyGenerator> {
        let len = match param.map(|p| p.trim().parse::<usize>()) {
            None => 8,
            Some(Ok(len)) if len > 0 => len,
            Some(_) => {
                warn!("Invalid key length {:?}, using 8", param);
                8
            }
        };
        Box::new(Self::new(len))
    }
}

impl KeyGenerator for BytesKeyGenerator {
    fn generate_key(&self, index: u64) -> Box<[u8]> {
        // keys shorter than 8 bytes keep the low-order bytes only
        let bytes = index.to_be_bytes();
        let mut key: Box<[u8]> = (0..self.len).map(|_| 0u8).collect();
        let len = self.len.min(8);
        key[self.len - len..].copy_from_slice(&bytes[8 - len..8]);
        key
    }
}

inventory::submit! {
    KeyGeneratorRegistry::new("bytes", BytesKeyGenerator::new_key_generator)
}

// }}} bytes

// {{{ values

/// Random byte values.
pub struct RandomValueGenerator;

impl RandomValueGenerator {
    pub fn new_value_generator(_param: Option<&str>) -> Box<dyn ValueGenerator> {
        Box::new(Self)
    }
}

impl ValueGenerator for RandomValueGenerator {
    fn generate_value(
        &self,
        _key: Option<&[u8]>,
        size: usize,
        rng: &mut dyn RngCore,
    ) -> Box<[u8]> {
        let mut value = vec![0u8; size].into_boxed_slice();
        rng.fill_bytes(&mut value);
        value
    }

    fn size_of(&self, value: &[u8]) -> usize {
        value.len()
    }

    fn check_value(&self, value: &[u8], expected_size: usize) -> bool {
        expected_size == 0 || value.len() == expected_size
    }
}

inventory::submit! {
    ValueGeneratorRegistry::new("random", RandomValueGenerator::new_value_generator)
}

/// Zero-filled values, the cheapest to generate.
pub struct ZeroValueGenerator;

impl ZeroValueGenerator {
    pub fn new_value_generator(_param: Option<&str>) -> Box<dyn ValueGenerator> {
        Box::new(Self)
    }
}

impl ValueGenerator for ZeroValueGenerator {
    fn generate_value(
        &self,
        _key: Option<&[u8]>,
        size: usize,
        _rng: &mut dyn RngCore,
    ) -> Box<[u8]> {
        vec![0u8; size].into_boxed_slice()
    }

    fn size_of(&self, value: &[u8]) -> usize {
        value.len()
    }

    fn check_value(&self, value: &[u8], expected_size: usize) -> bool {
        (expected_size == 0 || value.len() == expected_size) && value.iter().all(|b| *b == 0)
    }
}

inventory::submit! {
    ValueGeneratorRegistry::new("zeros", ZeroValueGenerator::new_value_generator)
}

// }}} values
