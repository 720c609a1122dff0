use crate::types::{Address, PAGE_SIZE};

use std::sync::{Mutex, PoisonError};

use hashbrown::HashMap;
use log::trace;

/// Upper bound on cached pages (64 MiB). When reached, entries of older
/// refresh epochs are dropped first.
const CACHE_MAX_PAGES: usize = 0x4000;

struct CacheEntry {
    epoch: u64,
    pb: Box<[u8]>,
}

/// Epoch-tagged physical page cache.
///
/// Pages are cached at 4k granularity. An entry is only valid while its
/// stored epoch equals the current refresh epoch; bumping the epoch
/// invalidates the whole cache without touching the entries themselves.
///
/// The cache is the backbone of the prefetch-then-resolve I/O discipline:
/// bulk prefetches populate it and subsequent cache-only reads resolve
/// against it without further device round-trips.
pub struct PageCache {
    map: Mutex<HashMap<u64, CacheEntry>>,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the page containing `pa` is cached for `epoch`.
    pub fn contains(&self, epoch: u64, pa: Address) -> bool {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&pa.as_page_aligned(PAGE_SIZE).as_u64())
            .map(|e| e.epoch == epoch)
            .unwrap_or(false)
    }

    /// Invokes `f` with the contents of the cached page containing `pa`,
    /// if it is present and valid for `epoch`.
    pub fn with_page<R>(&self, epoch: u64, pa: Address, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.get(&pa.as_page_aligned(PAGE_SIZE).as_u64())?;
        if entry.epoch != epoch {
            return None;
        }
        Some(f(&entry.pb))
    }

    /// Stores a full page. `pa` is truncated to its page base; `pb` must
    /// hold at least one page of data.
    pub fn put(&self, epoch: u64, pa: Address, pb: &[u8]) {
        if pb.len() < PAGE_SIZE {
            return;
        }
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if map.len() >= CACHE_MAX_PAGES {
            map.retain(|_, e| e.epoch == epoch);
            if map.len() >= CACHE_MAX_PAGES {
                trace!("page cache full, dropping all cached pages");
                map.clear();
            }
        }
        map.insert(
            pa.as_page_aligned(PAGE_SIZE).as_u64(),
            CacheEntry {
                epoch,
                pb: pb[..PAGE_SIZE].to_vec().into_boxed_slice(),
            },
        );
    }

    /// Drops all cached pages.
    pub fn clear(&self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_invalidation() {
        let cache = PageCache::new();
        let page = vec![0xCCu8; PAGE_SIZE];
        cache.put(1, Address::from(0x1000u64), &page);

        assert!(cache.contains(1, Address::from(0x1234u64)));
        assert_eq!(
            cache.with_page(1, Address::from(0x1000u64), |pb| pb[0]),
            Some(0xCC)
        );

        // entry becomes invisible after the epoch moves on
        assert!(!cache.contains(2, Address::from(0x1234u64)));
        assert_eq!(cache.with_page(2, Address::from(0x1000u64), |pb| pb[0]), None);
    }

    #[test]
    fn test_page_truncation() {
        let cache = PageCache::new();
        let page = vec![0u8; PAGE_SIZE];
        cache.put(1, Address::from(0x1888u64), &page);
        assert!(cache.contains(1, Address::from(0x1000u64)));
        assert!(!cache.contains(1, Address::from(0x2000u64)));
    }
}
