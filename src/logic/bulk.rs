//! Multi-key requests on a fixed keyspace.

use super::fixed::KeySet;
use super::OperationLogic;
use crate::stressor::{RequestError, Response, Stressor};
use crate::Request;
use hashbrown::HashSet;
use rand::rngs::SmallRng;
use rand::Rng;

/// Puts, removes or gets `bulk_size` distinct random keys of a key set at once. Keys drawn
/// twice are drawn again.
pub struct BulkLogic<K: KeySet> {
    keys: K,
    rng: SmallRng,
}

impl<K: KeySet> BulkLogic<K> {
    pub fn new(keys: K, rng: SmallRng) -> Self {
        Self { keys, rng }
    }

    fn distinct_keys(&mut self, thread_index: usize) -> Vec<Box<[u8]>> {
        let spec = self.keys.context().spec.clone();
        let mut seen = HashSet::with_capacity(spec.bulk_size);
        let mut keys = Vec::with_capacity(spec.bulk_size);
        while keys.len() < spec.bulk_size {
            let id = spec.key_dist.next(spec.entries, &mut self.rng);
            if seen.insert(id) {
                keys.push(self.keys.key(id, thread_index));
            }
        }
        keys
    }
}

impl<K: KeySet> OperationLogic for BulkLogic<K> {
    fn init(&mut self, stressor: &mut Stressor) {
        self.keys.load(stressor, &mut self.rng, &mut |_, _| {});
    }

    fn run(&mut self, stressor: &mut Stressor) -> Result<Response, RequestError> {
        let spec = self.keys.context().spec.clone();
        let prefer_async = spec.prefer_async;
        let action = self.rng.random_range(0..100u8);
        let keys = self.distinct_keys(stressor.index());
        let request = if action < spec.mix.write {
            let entries = keys
                .into_iter()
                .map(|key| {
                    let value = spec.generate_value(Some(&key), &mut self.rng);
                    (key, value)
                })
                .collect();
            Request::PutAll {
                entries,
                prefer_async,
            }
        } else if action < spec.mix.write + spec.mix.remove {
            Request::RemoveAll { keys, prefer_async }
        } else {
            Request::GetAll { keys, prefer_async }
        };
        stressor.make_request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{LogicContext, LogicKind};
    use crate::stores::hashmap::MutexHashMap;
    use crate::stressor::TransactionConfig;
    use crate::workload::{WorkloadOpt, WorkloadSpec};
    use crate::{KVMap, OperationKind};
    use std::sync::Arc;

    fn run(text: &str, requests: usize) -> (Arc<MutexHashMap>, Stressor) {
        let opt: WorkloadOpt = toml::from_str(text).unwrap();
        let spec = Arc::new(WorkloadSpec::new(&opt).unwrap());
        let map = Arc::new(MutexHashMap::with_shards(8));
        let ctx = Arc::new(LogicContext::new(spec.clone(), map.clone(), 1));
        let kind = LogicKind::select(&spec, map.capabilities()).unwrap();
        let mut s = Stressor::new(0, None, map.handle(), TransactionConfig::disabled());
        let mut logic = kind.new_logic(&ctx, 0);
        logic.init(&mut s);
        s.reset_stats();
        for _ in 0..requests {
            logic.run(&mut s).unwrap();
        }
        (map, s)
    }

    fn count(s: &Stressor, kind: OperationKind) -> u64 {
        s.stats().get(kind).map_or(0, |o| o.requests())
    }

    #[test]
    fn bulk_mix() {
        let (map, s) = run(
            "entries = 20\nbulk_size = 20\nwrite_perc = 50\nremove_perc = 0\nseed = 2",
            200,
        );
        // every put covers the whole keyspace
        assert_eq!(map.local_size(), 20);
        assert_eq!(count(&s, OperationKind::PutAll) + count(&s, OperationKind::GetAll), 200);
        assert!(count(&s, OperationKind::PutAll) > 0);
        assert_eq!(s.stats().errors(), 0);
    }

    #[test]
    fn bulk_remove_via_async() {
        let (map, s) = run(
            "entries = 10\nbulk_size = 10\nwrite_perc = 0\nremove_perc = 100\nprefer_async = true",
            1,
        );
        assert_eq!(map.local_size(), 0);
        assert_eq!(count(&s, OperationKind::RemoveAllViaAsync), 1);
        assert_eq!(count(&s, OperationKind::RemoveAll), 0);
    }
}
