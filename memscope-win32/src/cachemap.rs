/*!
Bounded snapshot cache validated by refresh epoch.

A cached snapshot is only returned while its stored epoch equals the
current refresh epoch; stale entries are evicted lazily on insert.
*/

use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;

pub struct EpochCache<V> {
    cap: usize,
    map: Mutex<HashMap<u64, (u64, Arc<V>)>>,
}

impl<V> EpochCache<V> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: u64, epoch: u64) -> Option<Arc<V>> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&key)
            .filter(|(e, _)| *e == epoch)
            .map(|(_, v)| v.clone())
    }

    pub fn put(&self, key: u64, epoch: u64, value: Arc<V>) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if map.len() >= self.cap {
            map.retain(|_, (e, _)| *e == epoch);
            if map.len() >= self.cap {
                // stale eviction was not enough, drop an arbitrary entry
                if let Some(k) = map.keys().next().copied() {
                    map.remove(&k);
                }
            }
        }
        map.insert(key, (epoch, value));
    }
}
