//! The stress controller.
//!
//! A stress run in this crate is a group of **stages** run sequentially against the same store.
//! Each stage spawns its worker threads, lets them preload keys, releases all of them at the
//! same time into the request loop, and merges their statistics into a flat result map once
//! the stage's completion condition is met.
//!
//! ## Configuration Format
//!
//! A stress configuration file is formatted in TOML. Stages are organized in an array, so the
//! configuration of each stage starts with `[[stress]]`. An optional `[global]` section fills in
//! options missing from a stage, and the `[map]` section (see [`mod@crate::stores`]) names the
//! store. A configuration generally looks like the following:
//!
//! ```toml
//! [map]
//! name = "mutex_hashmap"
//!
//! [global]
//! threads = 8
//! entries = 10000
//!
//! [[stress]]
//! requests = 1000000
//! write_perc = 20
//!
//! [[stress]]
//! duration = 10.0
//! atomics = true
//! ```
//!
//! Available options can be found in [`StressOpt`] and [`WorkloadOpt`] (the workload options
//! are flattened into the stage), and in [`GlobalOpt`] for the `[global]` section.
//!
//! Options in `[global]` can be overwritten via environment variables without changing the
//! content of the file: setting the environment variable `global.threads` overrides
//! `threads` in `[global]`.
//!
//! ## Ramp
//!
//! A stage with `ramp = { init = 1, max = 16, increment = 4 }` runs repeatedly with 1, 5, 9
//! and 13 threads. The workers of a previous iteration keep running and new ones are only
//! added. `requests` (or `duration`) is split evenly across iterations. The results of each
//! iteration are prefixed with its number (`000.`, `001.`, ...), and `REQ_PER_SEC` holds the
//! peak throughput over all iterations.
//!
//! ## Output Format
//!
//! The result of a stage is a map from metric names to numbers; see [`mod@crate::stats`] for
//! the metric names. The command line prints it as plain text, one metric per line:
//!
//! ```txt
//! stage 0 GET_COUNT 7996
//! stage 0 GET_ERRORS 0
//! ...
//! stage 0 REQ_PER_SEC 8125000.75
//! ```

use crate::completion::{CountCompletion, StressorCompletion, TimeCompletion};
use crate::error::{Error, Result};
use crate::logic::{LogicContext, LogicKind};
use crate::phase::PhaseSynchronizer;
use crate::stats::{ResultsMap, Statistics};
use crate::stores::{new_map, StoreOpt};
use crate::stressor::{worker_main, TransactionConfig, Worker, WorkerShared};
use crate::thread::JoinHandle;
use crate::workload::{BucketPolicy, EntrySizeOpt, WorkloadOpt, WorkloadSpec};
use crate::KVMap;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use quanta::Instant;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// {{{ stress

/// Increasing thread counts of a ramp stage.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RampOpt {
    /// Default: 1.
    pub init: Option<usize>,

    /// Default: 10.
    pub max: Option<usize>,

    /// Default: 1.
    pub increment: Option<usize>,
}

/// The configuration of a single stage deserialized from a TOML string.
///
/// The fields are optional to ease parsing from TOML, as there can be global parameters that are
/// set for them.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct StressOpt {
    /// Number of worker threads. Ignored with `ramp`.
    ///
    /// Default: 10.
    pub threads: Option<usize>,

    /// Total number of requests over all threads. Only used if `duration` is not given.
    ///
    /// Default: 50000.
    pub requests: Option<u64>,

    /// How long the request loop runs, unit is seconds.
    pub duration: Option<f32>,

    /// Progress of a count-limited run is logged by each thread every this many requests. `0`
    /// disables it.
    ///
    /// Default: 5000.
    pub ops_count_status_log: Option<u64>,

    /// Number of requests in a transaction.
    ///
    /// Default: 1.
    pub transaction_size: Option<usize>,

    /// Wrap requests in transactions. When not given, the store decides for each worker's
    /// bucket with [`KVMap::is_transactional`].
    pub use_transactions: Option<bool>,

    /// Commit transactions, or roll them back.
    ///
    /// Default: true.
    pub commit_transactions: Option<bool>,

    /// `"none"`, `"thread"` (bucket `bucket_<index>` per thread) or `"all:<name>"`.
    ///
    /// Default: "none".
    pub bucket: Option<BucketPolicy>,

    /// Pin worker `i` to core `i`.
    ///
    /// Default: false.
    pub pin: Option<bool>,

    /// Run with increasing thread counts instead of `threads`.
    pub ramp: Option<RampOpt>,

    /// The definition of the workload.
    ///
    /// This section is embedded and flattened, so that you can directly use options in
    /// [`WorkloadOpt`].
    #[serde(flatten)]
    pub workload: WorkloadOpt,
}

/// How long the request loop of a stage runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Length {
    /// Total requests over all threads.
    Count(u64),
    Duration(Duration),
}

impl Length {
    /// The share of one of `iterations` runs.
    fn split(&self, iterations: usize) -> Length {
        match self {
            Length::Count(c) => Length::Count(c / iterations as u64),
            Length::Duration(d) => Length::Duration(*d / iterations as u32),
        }
    }

    fn completion(&self, threads: usize, log_every: u64) -> Arc<dyn StressorCompletion> {
        match self {
            Length::Count(c) => Arc::new(CountCompletion::new(*c, threads, log_every)),
            Length::Duration(d) => Arc::new(TimeCompletion::new(*d)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ramp {
    pub init: usize,
    pub max: usize,
    pub increment: usize,
}

impl Ramp {
    /// The thread count of every iteration.
    pub fn threads(&self) -> impl Iterator<Item = usize> {
        (self.init..=self.max).step_by(self.increment)
    }

    pub fn iterations(&self) -> usize {
        (self.max - self.init) / self.increment + 1
    }
}

/// A validated stage.
#[derive(Debug)]
pub struct Stress {
    pub threads: usize,
    pub len: Length,
    pub log_every: u64,
    pub transaction_size: usize,
    pub use_transactions: Option<bool>,
    pub commit_transactions: bool,
    pub bucket: BucketPolicy,
    pub pin: bool,
    pub ramp: Option<Ramp>,
    pub workload: Arc<WorkloadSpec>,
}

impl Stress {
    /// Validate a stage whose global options are already applied.
    pub fn new(opt: &StressOpt) -> Result<Self> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));
        let threads = opt.threads.unwrap_or(10);
        if threads == 0 {
            return invalid("threads should be positive");
        }
        let len = match (opt.duration, opt.requests) {
            (Some(_), Some(_)) => {
                return invalid("duration and requests cannot be provided at the same time")
            }
            (Some(d), None) => match Duration::try_from_secs_f32(d) {
                Ok(d) if d > Duration::ZERO => Length::Duration(d),
                _ => return invalid("duration should be a positive number of seconds"),
            },
            (None, r) => Length::Count(r.unwrap_or(50000)),
        };
        let transaction_size = opt.transaction_size.unwrap_or(1);
        if transaction_size == 0 {
            return invalid("transaction_size should be positive");
        }
        let ramp = match opt.ramp {
            Some(r) => {
                let ramp = Ramp {
                    init: r.init.unwrap_or(1),
                    max: r.max.unwrap_or(10),
                    increment: r.increment.unwrap_or(1),
                };
                if ramp.init == 0 || ramp.increment == 0 || ramp.init > ramp.max {
                    return invalid("ramp should have 0 < init <= max and a positive increment");
                }
                Some(ramp)
            }
            None => None,
        };
        let workload = Arc::new(WorkloadSpec::new(&opt.workload)?);
        Ok(Self {
            threads,
            len,
            log_every: opt.ops_count_status_log.unwrap_or(5000),
            transaction_size,
            use_transactions: opt.use_transactions,
            commit_transactions: opt.commit_transactions.unwrap_or(true),
            bucket: opt.bucket.clone().unwrap_or_default(),
            pin: opt.pin.unwrap_or(false),
            ramp,
            workload,
        })
    }

    /// The largest number of workers of the stage.
    pub fn max_threads(&self) -> usize {
        match self.ramp {
            Some(ramp) => ramp.threads().last().unwrap_or(ramp.init),
            None => self.threads,
        }
    }

    /// Run the stage against `map` and return its results.
    ///
    /// Fails if the workload cannot run on the store, or if `sync` is interrupted. A stage
    /// whose workers failed fatally is reported with the results gathered so far.
    pub fn run(&self, map: &Arc<dyn KVMap>, sync: &Arc<PhaseSynchronizer>) -> Result<ResultsMap> {
        let mut test = StressTest::new(map.clone(), self, sync.clone())?;
        let results = match self.ramp {
            None => test.execute(self.threads, self.len, ""),
            Some(ramp) => self.run_ramp(&mut test, ramp),
        };
        let abort = results.is_err();
        if !test.finish(abort) {
            error!("Some stressor threads did not exit cleanly");
        }
        results
    }

    fn run_ramp(&self, test: &mut StressTest, ramp: Ramp) -> Result<ResultsMap> {
        info!(
            "Ramp stress test with {} - {} threads (increment {})",
            ramp.init, ramp.max, ramp.increment
        );
        let len = self.len.split(ramp.iterations());
        let mut results = ResultsMap::new();
        let mut peak = 0.0f64;
        for (iteration, threads) in ramp.threads().enumerate() {
            info!("Starting iteration {} with {} threads", iteration, threads);
            let prefix = format!("{:03}.", iteration);
            let r = test.execute(threads, len, &prefix)?;
            if test.is_terminated() {
                break;
            }
            if let Some(rps) = r.get(&format!("{}REQ_PER_SEC", prefix)) {
                peak = peak.max(*rps);
            }
            results.extend(r);
        }
        results.insert("REQ_PER_SEC".to_string(), peak);
        Ok(results)
    }
}

// }}} stress

// {{{ group

/// The global options that go to the `[global]` section.
///
/// They will override missing fields in each `[[stress]]` section, if the corresponding option
/// is missing. For the usage of each option, please refer to [`StressOpt`] and [`WorkloadOpt`].
#[derive(Deserialize, Clone, Debug, Default)]
pub struct GlobalOpt {
    // stress
    pub threads: Option<usize>,
    pub requests: Option<u64>,
    pub duration: Option<f32>,
    pub ops_count_status_log: Option<u64>,
    pub transaction_size: Option<usize>,
    pub use_transactions: Option<bool>,
    pub commit_transactions: Option<bool>,
    pub bucket: Option<BucketPolicy>,
    pub pin: Option<bool>,
    // workload
    pub entries: Option<u64>,
    pub entry_size: Option<EntrySizeOpt>,
    pub key_generator: Option<String>,
    pub key_generator_param: Option<String>,
    pub value_generator: Option<String>,
    pub value_generator_param: Option<String>,
    pub seed: Option<u64>,
    pub node_index: Option<usize>,
    pub num_nodes: Option<usize>,
}

impl GlobalOpt {
    fn apply(&self, opt: &mut StressOpt) {
        opt.threads = opt.threads.or(self.threads);
        // a stage giving one length ignores the global one
        if opt.requests.is_none() && opt.duration.is_none() {
            opt.requests = self.requests;
            opt.duration = self.duration;
        }
        opt.ops_count_status_log = opt.ops_count_status_log.or(self.ops_count_status_log);
        opt.transaction_size = opt.transaction_size.or(self.transaction_size);
        opt.use_transactions = opt.use_transactions.or(self.use_transactions);
        opt.commit_transactions = opt.commit_transactions.or(self.commit_transactions);
        opt.bucket = opt.bucket.clone().or_else(|| self.bucket.clone());
        opt.pin = opt.pin.or(self.pin);
        let w = &mut opt.workload;
        w.entries = w.entries.or(self.entries);
        w.entry_size = w.entry_size.clone().or_else(|| self.entry_size.clone());
        w.key_generator = w.key_generator.clone().or_else(|| self.key_generator.clone());
        w.key_generator_param = w
            .key_generator_param
            .clone()
            .or_else(|| self.key_generator_param.clone());
        w.value_generator = w
            .value_generator
            .clone()
            .or_else(|| self.value_generator.clone());
        w.value_generator_param = w
            .value_generator_param
            .clone()
            .or_else(|| self.value_generator_param.clone());
        w.seed = w.seed.or(self.seed);
        w.node_index = w.node_index.or(self.node_index);
        w.num_nodes = w.num_nodes.or(self.num_nodes);
    }
}

/// The configuration of a group of stages. It has a global option that could possibly override
/// stage-local options.
#[derive(Deserialize, Clone, Debug)]
struct StressGroupOpt {
    /// Global parameters (optional)
    global: Option<GlobalOpt>,

    /// Map configuration
    map: StoreOpt,

    /// Array of the parameters of consisting stages
    stress: Vec<StressOpt>,
}

/// Parse a whole configuration, create the store and validate every stage.
pub fn init(text: &str) -> Result<(Arc<dyn KVMap>, Vec<Stress>)> {
    let opt: StressGroupOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::raw().filter(|k| k.as_str().starts_with("global.")))
        .extract()?;
    debug!("Creating stress group with the following configurations: {:?}", opt);
    let global = opt.global.clone().unwrap_or_default();
    let mut sopts = opt.stress.clone();
    for sopt in sopts.iter_mut() {
        global.apply(sopt);
    }
    debug!("Global options applied to stages: {:?}", sopts);
    let map = new_map(&opt.map)?;
    let stages = sopts
        .iter()
        .enumerate()
        .map(|(i, o)| {
            Stress::new(o).map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("stage {}: {}", i, msg)),
                e => e,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((map, stages))
}

// }}} group

// {{{ controller

/// The controller of one stage: owns the workers and drives their phases.
pub struct StressTest {
    map: Arc<dyn KVMap>,
    sync: Arc<PhaseSynchronizer>,
    shared: Arc<WorkerShared>,
    ctx: Arc<LogicContext>,
    kind: LogicKind,
    log_every: u64,
    bucket: BucketPolicy,
    transaction_size: usize,
    use_transactions: Option<bool>,
    commit_transactions: bool,
    pin: bool,
    slots: Vec<Arc<Mutex<Statistics>>>,
    handles: Vec<Box<dyn JoinHandle>>,
    start: Instant,
}

impl StressTest {
    /// Select the workload strategy for the store. No thread is started yet.
    pub fn new(
        map: Arc<dyn KVMap>,
        stress: &Stress,
        sync: Arc<PhaseSynchronizer>,
    ) -> Result<Self> {
        let kind = LogicKind::select(&stress.workload, map.capabilities())?;
        let ctx = Arc::new(LogicContext::new(
            stress.workload.clone(),
            map.clone(),
            stress.max_threads(),
        ));
        let shared = Arc::new(WorkerShared {
            map: map.clone(),
            finished: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            completion: RwLock::new(stress.len.completion(stress.threads, stress.log_every)),
        });
        // collect whatever a previous stage left outstanding
        sync.phase_begin()?;
        Ok(Self {
            map,
            sync,
            shared,
            ctx,
            kind,
            log_every: stress.log_every,
            bucket: stress.bucket.clone(),
            transaction_size: stress.transaction_size,
            use_transactions: stress.use_transactions,
            commit_transactions: stress.commit_transactions,
            pin: stress.pin,
            slots: Vec::new(),
            handles: Vec::new(),
            start: Instant::now(),
        })
    }

    /// Whether a worker failed fatally.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    fn spawn(&mut self, index: usize) {
        let bucket = self.bucket.bucket_name(index);
        let enabled = self
            .use_transactions
            .unwrap_or_else(|| self.map.is_transactional(bucket.as_deref()));
        let slot = Arc::new(Mutex::new(Statistics::new()));
        let worker = Worker {
            index,
            bucket,
            tx_config: TransactionConfig {
                enabled,
                size: self.transaction_size,
                commit: self.commit_transactions,
            },
            pin: self.pin,
            logic: self.kind.new_logic(&self.ctx, index),
            phase: self.sync.worker(),
            shared: self.shared.clone(),
            slot: slot.clone(),
        };
        let handle = self
            .map
            .thread()
            .spawn(format!("Stressor-{}", index), Box::new(move || worker_main(worker)));
        self.slots.push(slot);
        self.handles.push(handle);
    }

    /// Preload and run with `threads` workers, spawning the missing ones, and merge the
    /// statistics of the run. Keys of every metric are prefixed with `prefix`.
    pub fn execute(&mut self, threads: usize, len: Length, prefix: &str) -> Result<ResultsMap> {
        self.ctx.set_threads(threads);
        self.sync.set_worker_count(threads);
        for index in self.handles.len()..threads {
            self.spawn(index);
        }
        info!("Store info is: {}", self.map.info());
        // preload
        self.sync.phase_end();
        self.sync.phase_begin()?;
        *self.shared.completion.write() = len.completion(threads, self.log_every);
        // run
        self.sync.phase_end();
        info!("Started {} stressor threads", self.handles.len());
        self.sync.phase_begin()?;
        let mut stats = Statistics::new();
        for slot in self.slots.iter().take(threads) {
            stats.merge(&slot.lock());
        }
        if stats.errors() > 0 {
            info!("{} requests failed in this run", stats.errors());
        }
        Ok(stats.results_map(threads, prefix))
    }

    /// Let all workers exit and join them. With `abort`, the phase in progress is drained
    /// first and the workers skip its remaining work. Returns whether every worker exited
    /// normally.
    pub fn finish(self, abort: bool) -> bool {
        if abort {
            self.shared.terminated.store(true, Ordering::Release);
            self.sync.phase_begin_uninterruptible();
        }
        self.shared.finished.store(true, Ordering::Release);
        self.sync.phase_end();
        self.sync.phase_begin_uninterruptible();
        let mut clean = true;
        for handle in self.handles {
            clean &= handle.join();
        }
        info!(
            "Finished stress test in {:.2?}",
            Instant::now().saturating_duration_since(self.start)
        );
        clean
    }
}

// }}} controller

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperationKind;
    use std::io::Write;

    const MUTEX_HASHMAP: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/presets/stores/mutex_hashmap.toml"
    ));

    fn run(text: &str) -> (Arc<dyn KVMap>, Vec<ResultsMap>) {
        let _ = env_logger::try_init();
        let (map, stages) = init(text).unwrap();
        let sync = Arc::new(PhaseSynchronizer::new());
        let results = stages
            .iter()
            .map(|s| s.run(&map, &sync).unwrap())
            .collect();
        (map, results)
    }

    fn config_error(text: &str) -> String {
        match init(text) {
            Err(Error::Config(msg)) => msg,
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("configuration accepted"),
        }
    }

    #[test]
    fn global_options_are_applied() {
        let opt = r#"
            [map]
            name = "nullmap"

            [global]
            threads = 8
            requests = 1000
            transaction_size = 4
            bucket = "thread"
            entries = 500
            seed = 7

            [[stress]]
            write_perc = 50

            [[stress]]
            threads = 2
            duration = 1.5
            entries = 10
        "#;
        let (_, stages) = init(opt).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].threads, 8);
        assert_eq!(stages[0].len, Length::Count(1000));
        assert_eq!(stages[0].transaction_size, 4);
        assert_eq!(stages[0].bucket, BucketPolicy::Thread);
        assert_eq!(stages[0].workload.entries, 500);
        assert_eq!(stages[0].workload.mix.write, 50);
        assert_eq!(stages[0].workload.seed, Some(7));
        assert_eq!(stages[1].threads, 2);
        assert_eq!(stages[1].len, Length::Duration(Duration::from_secs_f32(1.5)));
        assert_eq!(stages[1].workload.entries, 10);
    }

    #[test]
    fn defaults_are_applied() {
        let opt = r#"
            [map]
            name = "nullmap"

            [[stress]]
        "#;
        let (_, stages) = init(opt).unwrap();
        let s = &stages[0];
        assert_eq!(s.threads, 10);
        assert_eq!(s.len, Length::Count(50000));
        assert_eq!(s.log_every, 5000);
        assert_eq!(s.transaction_size, 1);
        assert_eq!(s.use_transactions, None);
        assert!(s.commit_transactions);
        assert_eq!(s.bucket, BucketPolicy::None);
        assert!(!s.pin);
        assert!(s.ramp.is_none());
        assert_eq!(s.workload.entries, 100);
        assert_eq!(s.workload.mix.write, 20);
    }

    #[test]
    fn invalid_options() {
        let stage = |s: &str| format!("[map]\nname = \"nullmap\"\n[[stress]]\n{}", s);
        config_error(&stage("threads = 0"));
        config_error(&stage("requests = 10\nduration = 1.0"));
        config_error(&stage("duration = 0.0"));
        config_error(&stage("duration = inf"));
        config_error(&stage("duration = nan"));
        config_error(&stage("transaction_size = 0"));
        config_error(&stage("ramp = { init = 4, max = 2 }"));
        config_error(&stage("ramp = { increment = 0 }"));
        config_error(&stage("write_perc = 101"));
        let msg = config_error(&stage("entries = 0"));
        assert!(msg.starts_with("stage 0"));
        assert!(matches!(
            init(&stage("bucket = \"some\"")),
            Err(Error::Figment(_))
        ));
        assert!(matches!(
            init("[map]\nname = \"nonexistent\"\n[[stress]]\n"),
            Err(Error::UnknownStore(_))
        ));
    }

    #[test]
    fn unsupported_workload_fails_before_running() {
        let (map, stages) =
            init("[map]\nname = \"mutex_btreemap\"\n[[stress]]\natomics = true\n").unwrap();
        let sync = Arc::new(PhaseSynchronizer::new());
        assert!(matches!(stages[0].run(&map, &sync), Err(Error::Config(_))));
    }

    #[test]
    fn per_thread_scenario() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            threads = 4
            entries = 100
            write_perc = 20
            requests = 10000
            entry_size = 16
        "#;
        let (map, results) = run(&opt);
        let r = &results[0];
        assert_eq!(r["REQUESTS"], 10000.0);
        assert_eq!(r["ERRORS"], 0.0);
        assert_eq!(r["THREADS"], 4.0);
        assert_eq!(r["GET_COUNT"] + r["PUT_COUNT"], 10000.0);
        assert!(!r.contains_key("GET_NULL_COUNT"));
        assert!(r["REQ_PER_SEC"] > 0.0);
        // every thread preloaded its own keys
        assert_eq!(map.local_size(), 400);
    }

    #[test]
    fn shared_scenario() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            threads = 8
            entries = 50
            shared_keys = true
            requests = 800
            entry_size = 16
        "#;
        let (map, results) = run(&opt);
        assert_eq!(map.local_size(), 50);
        assert_eq!(results[0]["REQUESTS"], 800.0);
        assert_eq!(results[0]["ERRORS"], 0.0);
    }

    #[test]
    fn timed_stage() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            threads = 2
            duration = 0.2
            entries = 10
            entry_size = 8
        "#;
        let (_, results) = run(&opt);
        let r = &results[0];
        assert!(r["REQUESTS"] > 0.0);
        assert!(r["DURATION_NS"] >= 200_000_000.0);
    }

    #[test]
    fn ramp_reports_every_iteration() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            ramp = { init = 1, max = 4, increment = 2 }
            requests = 1000
            entries = 10
            entry_size = 8
        "#;
        let (map, results) = run(&opt);
        let r = &results[0];
        assert_eq!(r["000.THREADS"], 1.0);
        assert_eq!(r["001.THREADS"], 3.0);
        assert!(!r.contains_key("002.THREADS"));
        assert_eq!(r["000.REQUESTS"], 500.0);
        assert_eq!(r["001.REQUESTS"], 500.0);
        let peak = r["000.REQ_PER_SEC"].max(r["001.REQ_PER_SEC"]);
        assert_eq!(r["REQ_PER_SEC"], peak);
        // per-thread keys of the three workers
        assert_eq!(map.local_size(), 30);
    }

    #[test]
    fn stages_share_the_store() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [global]
            requests = 200
            entry_size = 8

            [[stress]]
            threads = 2
            entries = 10

            [[stress]]
            threads = 3
            entries = 10
            key_generator_param = "other_"
        "#;
        let (map, results) = run(&opt);
        assert_eq!(results.len(), 2);
        assert_eq!(map.local_size(), 20 + 30);
    }

    #[test]
    fn changing_set_stage() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            threads = 2
            fixed_keys = false
            entries = 100
            write_perc = 50
            requests = 2000
            entry_size = [{ size = 10, weight = 1.0 }, { size = 20, weight = 1.0 }]
        "#;
        let (map, results) = run(&opt);
        assert_eq!(results[0]["REQUESTS"], 2000.0);
        assert_eq!(results[0]["ERRORS"], 0.0);
        assert!(map.local_size() <= 200);
    }

    #[test]
    fn interrupted_stage() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            threads = 2
            duration = 30.0
            entries = 10
            entry_size = 8
        "#;
        let (map, stages) = init(&opt).unwrap();
        let sync = Arc::new(PhaseSynchronizer::new());
        let s = sync.clone();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            s.interrupt();
        });
        let start = std::time::Instant::now();
        assert!(matches!(stages[0].run(&map, &sync), Err(Error::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(20));
        interrupter.join().unwrap();
    }

    #[test]
    fn preset_stress_files() {
        for stress in [
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/presets/stress/example.toml"
            )),
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/presets/stress/example_atomic.toml"
            )),
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/presets/stress/example_changing.toml"
            )),
        ] {
            let opt = MUTEX_HASHMAP.to_string() + "\n" + stress;
            let (_, results) = run(&opt);
            for r in results {
                assert_eq!(r["ERRORS"], 0.0);
            }
        }
    }

    #[test]
    fn preset_store_files() {
        for store in [
            include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/presets/stores/null.toml")),
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/presets/stores/rwlock_hashmap.toml"
            )),
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/presets/stores/mutex_btreemap.toml"
            )),
        ] {
            let opt = store.to_string() + "\n[[stress]]\nthreads = 2\nrequests = 100\n";
            let (_, results) = run(&opt);
            assert_eq!(results[0]["REQUESTS"], 100.0);
        }
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", MUTEX_HASHMAP).unwrap();
        writeln!(file, "[[stress]]\nthreads = 1\nrequests = 10\n").unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let (_, stages) = init(&text).unwrap();
        assert_eq!(stages[0].len, Length::Count(10));
    }

    #[test]
    fn transactions_are_recorded() {
        let opt = MUTEX_HASHMAP.to_string()
            + r#"
            [[stress]]
            threads = 1
            requests = 10
            use_transactions = true
            transaction_size = 5
        "#;
        let (_, results) = run(&opt);
        let r = &results[0];
        // the built-in stores have no transactions
        assert_eq!(r[&format!("{}_ERRORS", OperationKind::Transaction)], 10.0);
        assert_eq!(r["REQUESTS"], 0.0);
    }
}

// }}} tests
