//! Block-granular caching of table file windows.
//!
//! Readers never touch the file directly; they borrow a [`MapRef`] over a
//! whole block. Closed blocks (fully below the append point) are immutable
//! and cached under a shared byte budget with LRU eviction of windows no
//! reader holds. The open block is fetched fresh on every request since it
//! is still growing.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::repo::{TableStorage, Window};

pub const DEFAULT_MAP_BUDGET: u64 = 1024 * 1024 * 1024;

/// Byte budget shared by every table of one database.
#[derive(Debug)]
pub struct MapBudget {
    max_bytes: u64,
    used: AtomicU64,
}

impl MapBudget {
    pub fn new(max_bytes: u64) -> Self {
        MapBudget {
            max_bytes,
            used: AtomicU64::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

impl Default for MapBudget {
    fn default() -> Self {
        MapBudget::new(DEFAULT_MAP_BUDGET)
    }
}

#[derive(Debug)]
pub struct DataMap {
    bytes: Window,
    ro: u64,
}

impl DataMap {
    pub fn offset(&self) -> u64 {
        self.ro
    }
}

/// Refcounted handle onto one block window.
#[derive(Clone, Debug)]
pub struct MapRef(Arc<DataMap>);

impl std::ops::Deref for MapRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0.bytes
    }
}

impl MapRef {
    pub fn offset(&self) -> u64 {
        self.0.ro
    }
}

pub struct DataMapCache<S> {
    inner: Arc<CacheInner<S>>,
}

impl<S> Clone for DataMapCache<S> {
    fn clone(&self) -> Self {
        DataMapCache {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<S> {
    storage: Arc<S>,
    block: usize,
    budget: Arc<MapBudget>,
    maps: Mutex<MapTable>,
}

#[derive(Default)]
struct MapTable {
    by_off: HashMap<u64, Arc<DataMap>>,
    lru: Vec<u64>,
}

impl<S: TableStorage> DataMapCache<S> {
    pub fn new(storage: Arc<S>, block: usize, budget: Arc<MapBudget>) -> Self {
        DataMapCache {
            inner: Arc::new(CacheInner {
                storage,
                block,
                budget,
                maps: Mutex::new(MapTable::default()),
            }),
        }
    }

    /// Window over the block starting at `off`. Only closed blocks are
    /// cached; the open block may still grow underneath a cached copy.
    pub fn get(&self, off: u64, closed: bool) -> io::Result<MapRef> {
        debug_assert_eq!(off as usize % self.inner.block, 0);
        if !closed {
            let bytes = self.inner.storage.map(off, self.inner.block)?;
            return Ok(MapRef(Arc::new(DataMap { bytes, ro: off })));
        }

        let mut maps = self.inner.maps.lock();
        if let Some(map) = maps.by_off.get(&off) {
            let map = map.clone();
            maps.lru.retain(|&o| o != off);
            maps.lru.push(off);
            return Ok(MapRef(map));
        }

        let bytes = self.inner.storage.map(off, self.inner.block)?;
        let map = Arc::new(DataMap { bytes, ro: off });
        maps.by_off.insert(off, map.clone());
        maps.lru.push(off);
        let used = self
            .inner
            .budget
            .used
            .fetch_add(self.inner.block as u64, Ordering::Relaxed)
            + self.inner.block as u64;
        if used > self.inner.budget.max_bytes {
            self.evict(&mut maps);
        }
        trace!("mapped block at {off}, cache now {} bytes", self.inner.budget.used());
        Ok(MapRef(map))
    }

    /// Drop least-recently-used windows nobody holds until the budget is
    /// respected again. Pinned windows are skipped; going over budget with
    /// live references is allowed.
    fn evict(&self, maps: &mut MapTable) {
        let mut i = 0;
        while i < maps.lru.len() && self.inner.budget.used() > self.inner.budget.max_bytes {
            let off = maps.lru[i];
            let unreferenced = maps
                .by_off
                .get(&off)
                .map(|m| Arc::strong_count(m) == 1)
                .unwrap_or(false);
            if unreferenced {
                maps.by_off.remove(&off);
                maps.lru.remove(i);
                self.inner
                    .budget
                    .used
                    .fetch_sub(self.inner.block as u64, Ordering::Relaxed);
            } else {
                i += 1;
            }
        }
    }

    /// Forget every cached window (generation bump).
    pub fn invalidate(&self) {
        let mut maps = self.inner.maps.lock();
        let n = maps.by_off.len() as u64 * self.inner.block as u64;
        maps.by_off.clear();
        maps.lru.clear();
        self.inner.budget.used.fetch_sub(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{Memory, Repo};

    #[test]
    fn caches_closed_blocks_and_refreshes_open_ones() {
        let repo = Memory::new();
        let storage = Arc::new(repo.create("t.dt0").unwrap());
        storage.set_len(8192).unwrap();
        storage.write_all_at(b"aa", 0).unwrap();

        let cache = DataMapCache::new(storage.clone(), 4096, Arc::new(MapBudget::default()));
        let closed = cache.get(0, true).unwrap();
        assert_eq!(&closed[..2], b"aa");

        // mutate underneath: the cached closed window stays as-is,
        // an open fetch sees the new bytes
        storage.write_all_at(b"bb", 0).unwrap();
        let cached = cache.get(0, true).unwrap();
        assert_eq!(&cached[..2], b"aa");
        let open = cache.get(0, false).unwrap();
        assert_eq!(&open[..2], b"bb");
    }

    #[test]
    fn evicts_unreferenced_windows_over_budget() {
        let repo = Memory::new();
        let storage = Arc::new(repo.create("t.dt0").unwrap());
        storage.set_len(4096 * 8).unwrap();

        let budget = Arc::new(MapBudget::new(4096 * 2));
        let cache = DataMapCache::new(storage, 4096, budget.clone());
        for i in 0..4u64 {
            drop(cache.get(i * 4096, true).unwrap());
        }
        assert!(budget.used() <= 4096 * 2);
    }
}
