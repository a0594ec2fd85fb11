//! Workload definition: keyspace, entry sizes, operation mix and generators.
//!
//! The options are read from the same `[[stress]]` section as the run options (they are
//! flattened into [`crate::stress::StressOpt`]), and validated into an immutable
//! [`WorkloadSpec`] before any worker starts. The workload logic never looks at raw options.
//!
//! ## Entry Sizes
//!
//! `entry_size` is either a fixed number of bytes, or a weighted list of sizes:
//!
//! ```toml
//! entry_size = 1000
//! # or
//! entry_size = [{ size = 100, weight = 3 }, { size = 10000, weight = 1 }]
//! ```
//!
//! ## Operation Mix
//!
//! Every request draws a number in `0..100` and compares it against cumulative thresholds.
//! Fixed keyspaces use `write_perc`, then `remove_perc`, and read otherwise. With `atomics`,
//! `remove_invalid_perc` and `replace_invalid_perc` follow, and the remainder are valid
//! replaces.

use crate::error::{Error, Result};
use crate::generator::Generators;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use rand_distr::Zipf;
use serde::Deserialize;
use std::time::Duration;

// {{{ options

/// A weighted entry size.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct WeightedSize {
    pub size: usize,
    pub weight: f64,
}

/// The `entry_size` option.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum EntrySizeOpt {
    Fixed(usize),
    Weighted(Vec<WeightedSize>),
}

/// Workload options of a stress stage. All fields are optional, missing ones are filled from
/// `[global]` and then from the defaults documented below.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct WorkloadOpt {
    /// Number of keys, per thread or shared. Default: 100.
    pub entries: Option<u64>,

    /// Byte budget of the live entries. Only with `fixed_keys = false`, where it takes
    /// precedence over `entries`. Default: 0 (unset).
    pub bytes: Option<u64>,

    /// Size of values in bytes. Default: 1000.
    pub entry_size: Option<EntrySizeOpt>,

    /// Percentage of writes. Default: 20.
    pub write_perc: Option<u8>,

    /// Percentage of removes. Default: 0.
    pub remove_perc: Option<u8>,

    /// With `atomics`: percentage of conditional removes with a stale value. Default: 10.
    pub remove_invalid_perc: Option<u8>,

    /// With `atomics`: percentage of replaces with a stale value. Default: 40.
    pub replace_invalid_perc: Option<u8>,

    /// Number of keys in one bulk request. Default: 1 (no bulk requests).
    pub bulk_size: Option<usize>,

    /// Issue bulk requests as several asynchronous requests if the store can. Default: false.
    pub prefer_async: Option<bool>,

    /// All threads share one keyspace instead of having their own. Default: false.
    pub shared_keys: Option<bool>,

    /// Keep the keyspace fixed, or churn it with scheduled expirations. Default: true.
    pub fixed_keys: Option<bool>,

    /// Do not complain about entries that disappear on their own (eviction, expiration).
    /// Default: false.
    pub expect_lost_keys: Option<bool>,

    /// With `fixed_keys = false`, the maximal lifespan of an entry in seconds. Default: 3600.
    pub entry_lifespan: Option<f32>,

    /// Use conditional operations. Default: false.
    pub atomics: Option<bool>,

    /// Keep generated keys in memory instead of regenerating them for every request.
    /// Default: true.
    pub pool_keys: Option<bool>,

    /// Key selection in fixed keyspaces: "uniform" or "zipfian". Default: "uniform".
    pub key_dist: Option<String>,

    /// Skew of "zipfian". Default: 1.0.
    pub zipf_theta: Option<f64>,

    /// Default: "string".
    pub key_generator: Option<String>,
    pub key_generator_param: Option<String>,

    /// Default: "random".
    pub value_generator: Option<String>,
    pub value_generator_param: Option<String>,

    /// Seed of the per-thread random generators; thread `i` uses `seed + i`. Default: random.
    pub seed: Option<u64>,

    /// Index of this node when several nodes stress the same store. Offsets the keys of this
    /// node. Default: unset (single node).
    pub node_index: Option<usize>,

    /// Number of nodes stressing the same store. Default: 1.
    pub num_nodes: Option<usize>,
}

// }}} options

// {{{ sizes

/// The distribution of value sizes.
#[derive(Clone, Debug)]
pub struct SizeDistribution {
    sizes: Vec<usize>,
    probabilities: Vec<f64>,
    index: Option<WeightedIndex<f64>>,
}

impl SizeDistribution {
    pub fn fixed(size: usize) -> Self {
        Self {
            sizes: vec![size],
            probabilities: vec![1.0],
            index: None,
        }
    }

    pub fn new(opt: &EntrySizeOpt) -> Result<Self> {
        let weighted = match opt {
            EntrySizeOpt::Fixed(size) => return Ok(Self::fixed(*size)),
            EntrySizeOpt::Weighted(w) => w,
        };
        if weighted.is_empty() {
            return Err(Error::Config("entry_size should not be empty".to_string()));
        }
        // duplicated sizes are merged
        let mut sizes: Vec<usize> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for w in weighted.iter() {
            if !(w.weight > 0.0) {
                return Err(Error::Config(format!(
                    "entry_size weight of size {} should be positive",
                    w.size
                )));
            }
            match sizes.iter().position(|s| *s == w.size) {
                Some(i) => weights[i] += w.weight,
                None => {
                    sizes.push(w.size);
                    weights.push(w.weight);
                }
            }
        }
        let total: f64 = weights.iter().sum();
        let probabilities = weights.iter().map(|w| w / total).collect();
        let index = WeightedIndex::new(&weights)
            .map_err(|e| Error::Config(format!("invalid entry_size weights: {}", e)))?;
        Ok(Self {
            sizes,
            probabilities,
            index: Some(index),
        })
    }

    pub fn next(&self, rng: &mut impl Rng) -> usize {
        match self.index {
            Some(ref index) => self.sizes[index.sample(rng)],
            None => self.sizes[0],
        }
    }

    /// Every size with its probability.
    pub fn probabilities(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.sizes
            .iter()
            .copied()
            .zip(self.probabilities.iter().copied())
    }

    pub fn average(&self) -> f64 {
        self.probabilities()
            .map(|(size, p)| size as f64 * p)
            .sum()
    }
}

// }}} sizes

// {{{ keys

/// How a fixed keyspace is accessed.
#[derive(Clone, Debug)]
pub enum KeyDistribution {
    Uniform,
    Zipfian(Zipf<f64>),
}

impl KeyDistribution {
    /// An index in `0..n`.
    pub fn next(&self, n: u64, rng: &mut impl Rng) -> u64 {
        match self {
            KeyDistribution::Uniform => rng.random_range(0..n),
            // zipf starts at 1
            KeyDistribution::Zipfian(dist) => (dist.sample(rng) as u64).clamp(1, n) - 1,
        }
    }
}

// }}} keys

// {{{ buckets

/// Which bucket each thread sends its requests to.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum BucketPolicy {
    /// No bucket at all.
    #[default]
    None,
    /// `bucket_<index>` for thread `index`.
    Thread,
    /// The same named bucket for every thread.
    All(String),
}

impl TryFrom<String> for BucketPolicy {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "none" => Ok(BucketPolicy::None),
            "thread" => Ok(BucketPolicy::Thread),
            _ => match s.strip_prefix("all:") {
                Some(name) if !name.is_empty() => Ok(BucketPolicy::All(name.to_string())),
                _ => Err(format!(
                    "bucket should be one of: none, thread, all:<name>, got {}",
                    s
                )),
            },
        }
    }
}

impl BucketPolicy {
    pub fn bucket_name(&self, thread_index: usize) -> Option<String> {
        match self {
            BucketPolicy::None => None,
            BucketPolicy::Thread => Some(format!("bucket_{}", thread_index)),
            BucketPolicy::All(name) => Some(name.clone()),
        }
    }
}

// }}} buckets

// {{{ workload_spec

/// Operation thresholds, each in `0..=100`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mix {
    pub write: u8,
    pub remove: u8,
    pub remove_invalid: u8,
    pub replace_invalid: u8,
}

/// A validated workload. Read-only for the whole run.
#[derive(Debug)]
pub struct WorkloadSpec {
    pub entries: u64,
    pub bytes: u64,
    pub entry_size: SizeDistribution,
    pub mix: Mix,
    pub bulk_size: usize,
    pub prefer_async: bool,
    pub shared_keys: bool,
    pub fixed_keys: bool,
    pub expect_lost_keys: bool,
    pub entry_lifespan: Duration,
    pub atomics: bool,
    pub pool_keys: bool,
    pub key_dist: KeyDistribution,
    pub seed: Option<u64>,
    /// `None` for a single-node run.
    pub node_index: Option<usize>,
    pub num_nodes: usize,
    pub generators: Generators,
}

fn perc(name: &str, value: Option<u8>, default: u8) -> Result<u8> {
    let v = value.unwrap_or(default);
    if v > 100 {
        return Err(Error::Config(format!(
            "{} should be in 0..=100, got {}",
            name, v
        )));
    }
    Ok(v)
}

impl WorkloadSpec {
    pub fn new(opt: &WorkloadOpt) -> Result<Self> {
        let entries = opt.entries.unwrap_or(100);
        let bytes = opt.bytes.unwrap_or(0);
        let fixed_keys = opt.fixed_keys.unwrap_or(true);
        if entries == 0 && !(bytes > 0 && !fixed_keys) {
            return Err(Error::Config("entries should be positive".to_string()));
        }
        let entry_size = match opt.entry_size {
            Some(ref s) => SizeDistribution::new(s)?,
            None => SizeDistribution::fixed(1000),
        };
        let mix = Mix {
            write: perc("write_perc", opt.write_perc, 20)?,
            remove: perc("remove_perc", opt.remove_perc, 0)?,
            remove_invalid: perc("remove_invalid_perc", opt.remove_invalid_perc, 10)?,
            replace_invalid: perc("replace_invalid_perc", opt.replace_invalid_perc, 40)?,
        };
        let atomics = opt.atomics.unwrap_or(false);
        if mix.write as u32 + mix.remove as u32 > 100 {
            return Err(Error::Config(
                "write_perc + remove_perc should not exceed 100".to_string(),
            ));
        }
        if atomics
            && mix.write as u32
                + mix.remove as u32
                + mix.remove_invalid as u32
                + mix.replace_invalid as u32
                > 100
        {
            return Err(Error::Config(
                "write_perc + remove_perc + remove_invalid_perc + replace_invalid_perc should \
                 not exceed 100"
                    .to_string(),
            ));
        }
        let bulk_size = opt.bulk_size.unwrap_or(1);
        if bulk_size == 0 {
            return Err(Error::Config("bulk_size should be positive".to_string()));
        }
        let lifespan = match Duration::try_from_secs_f32(opt.entry_lifespan.unwrap_or(3600.0)) {
            Ok(d) if d > Duration::ZERO => d,
            _ => {
                return Err(Error::Config(
                    "entry_lifespan should be a positive number of seconds".to_string(),
                ))
            }
        };
        let key_dist = match opt.key_dist.as_deref().unwrap_or("uniform") {
            "uniform" => KeyDistribution::Uniform,
            "zipfian" => {
                let theta = opt.zipf_theta.unwrap_or(1.0);
                let zipf = Zipf::new(entries.max(1) as f64, theta)
                    .map_err(|e| Error::Config(format!("invalid zipf_theta {}: {}", theta, e)))?;
                KeyDistribution::Zipfian(zipf)
            }
            d => {
                return Err(Error::Config(format!(
                    "key_dist should be one of: uniform, zipfian, got {}",
                    d
                )))
            }
        };
        let num_nodes = opt.num_nodes.unwrap_or(1);
        if num_nodes == 0 {
            return Err(Error::Config("num_nodes should be positive".to_string()));
        }
        if let Some(i) = opt.node_index {
            if i >= num_nodes {
                return Err(Error::Config(format!(
                    "node_index {} should be less than num_nodes {}",
                    i, num_nodes
                )));
            }
        }
        let generators = Generators::resolve(
            opt.key_generator.as_deref().unwrap_or("string"),
            opt.key_generator_param.clone(),
            opt.value_generator.as_deref().unwrap_or("random"),
            opt.value_generator_param.clone(),
        )?;
        Ok(Self {
            entries,
            bytes,
            entry_size,
            mix,
            bulk_size,
            prefer_async: opt.prefer_async.unwrap_or(false),
            shared_keys: opt.shared_keys.unwrap_or(false),
            fixed_keys,
            expect_lost_keys: opt.expect_lost_keys.unwrap_or(false),
            entry_lifespan: lifespan,
            atomics,
            pool_keys: opt.pool_keys.unwrap_or(true),
            key_dist,
            seed: opt.seed,
            node_index: opt.node_index,
            num_nodes,
            generators,
        })
    }

    /// Generate a value with a size drawn from the entry size distribution.
    pub fn generate_value(&self, key: Option<&[u8]>, rng: &mut impl rand::RngCore) -> Box<[u8]> {
        let size = self.entry_size.next(rng);
        self.generators.value().generate_value(key, size, rng)
    }
}

// }}} workload_spec

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn opt(text: &str) -> WorkloadOpt {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn defaults() {
        let spec = WorkloadSpec::new(&WorkloadOpt::default()).unwrap();
        assert_eq!(spec.entries, 100);
        assert_eq!(spec.entry_size.average(), 1000.0);
        assert_eq!(
            spec.mix,
            Mix {
                write: 20,
                remove: 0,
                remove_invalid: 10,
                replace_invalid: 40
            }
        );
        assert!(spec.fixed_keys);
        assert!(spec.pool_keys);
        assert!(!spec.shared_keys);
        assert_eq!(spec.entry_lifespan, Duration::from_secs(3600));
        assert_eq!(spec.num_nodes, 1);
        assert!(spec.node_index.is_none());
    }

    #[test]
    fn weighted_sizes() {
        let o = opt(
            r#"
            entry_size = [{ size = 100, weight = 3.0 }, { size = 1000, weight = 1.0 }, { size = 100, weight = 4.0 }]
            "#,
        );
        let dist = SizeDistribution::new(o.entry_size.as_ref().unwrap()).unwrap();
        let probs: Vec<_> = dist.probabilities().collect();
        assert_eq!(probs, vec![(100, 0.875), (1000, 0.125)]);

        let mut rng = SmallRng::seed_from_u64(7);
        let mut small = 0;
        for _ in 0..10000 {
            match dist.next(&mut rng) {
                100 => small += 1,
                1000 => {}
                s => panic!("unexpected size {}", s),
            }
        }
        assert!(small > 8000 && small < 9500);
    }

    #[test]
    fn fixed_size_from_toml() {
        let o = opt("entry_size = 64");
        assert_eq!(o.entry_size, Some(EntrySizeOpt::Fixed(64)));
        let spec = WorkloadSpec::new(&o).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(spec.generate_value(None, &mut rng).len(), 64);
    }

    #[test]
    fn invalid_sizes() {
        let o = opt("entry_size = []");
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
        let o = opt("entry_size = [{ size = 1, weight = 0.0 }]");
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_lifespans() {
        for l in ["0.0", "-1.0", "inf", "nan"] {
            let o = opt(&format!("entry_lifespan = {}", l));
            assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))), "{}", l);
        }
        let o = opt("entry_lifespan = 0.5");
        assert_eq!(
            WorkloadSpec::new(&o).unwrap().entry_lifespan,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn invalid_percentages() {
        let o = opt("write_perc = 101");
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
        let o = opt("write_perc = 60\nremove_perc = 50");
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
        // the atomic percentages only matter with atomics
        let o = opt("write_perc = 50\nremove_invalid_perc = 30\nreplace_invalid_perc = 30");
        assert!(WorkloadSpec::new(&o).is_ok());
        let o = opt(
            "atomics = true\nwrite_perc = 50\nremove_invalid_perc = 30\nreplace_invalid_perc = 30",
        );
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_nodes() {
        let o = opt("node_index = 2\nnum_nodes = 2");
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
        let o = opt("node_index = 1\nnum_nodes = 2");
        assert!(WorkloadSpec::new(&o).is_ok());
    }

    #[test]
    fn unknown_generator() {
        let o = opt("key_generator = \"nope\"");
        assert!(matches!(
            WorkloadSpec::new(&o),
            Err(Error::UnknownGenerator { .. })
        ));
    }

    #[test]
    fn key_distributions() {
        let mut rng = SmallRng::seed_from_u64(3);
        let uniform = KeyDistribution::Uniform;
        for _ in 0..1000 {
            assert!(uniform.next(10, &mut rng) < 10);
        }
        let spec = WorkloadSpec::new(&opt("key_dist = \"zipfian\"\nzipf_theta = 0.99")).unwrap();
        let mut hits = [0u64; 100];
        for _ in 0..10000 {
            let k = spec.key_dist.next(100, &mut rng);
            hits[k as usize] += 1;
        }
        assert!(hits[0] > hits[50]);
        let o = opt("key_dist = \"sequential\"");
        assert!(matches!(WorkloadSpec::new(&o), Err(Error::Config(_))));
    }

    #[test]
    fn bucket_policies() {
        #[derive(Deserialize)]
        struct B {
            bucket: BucketPolicy,
        }
        let b: B = toml::from_str("bucket = \"none\"").unwrap();
        assert_eq!(b.bucket.bucket_name(3), None);
        let b: B = toml::from_str("bucket = \"thread\"").unwrap();
        assert_eq!(b.bucket.bucket_name(3), Some("bucket_3".to_string()));
        let b: B = toml::from_str("bucket = \"all:users\"").unwrap();
        assert_eq!(b.bucket.bucket_name(3), Some("users".to_string()));
        assert!(toml::from_str::<B>("bucket = \"all:\"").is_err());
        assert!(toml::from_str::<B>("bucket = \"some\"").is_err());
    }
}
