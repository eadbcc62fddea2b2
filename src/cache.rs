//! Process-wide block cache.
//!
//! Byte blocks read from sorted files are cached under (file id, offset).
//! Entries live in one of three priority bands:
//!
//! - SINGLE: first insertion; cheap to evict.
//! - MULTI: promoted on a second hit.
//! - IN_MEMORY: pinned families and the important blocks (index, bloom).
//!
//! The evictor walks bands in SINGLE → MULTI → IN_MEMORY order and never
//! shrinks a band below its floor. Within a band, eviction is approximate
//! LRU: each entry carries a small access frequency that is decremented as
//! the clock hand passes, and only zero-frequency entries are dropped.
//!
//! Locking is striped per band; metrics are plain atomics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum access frequency an entry can accumulate.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Fraction of total capacity each band keeps even under pressure.
const BAND_FLOOR_FRACTION: f64 = 0.05;

/// What kind of bytes a cached block holds. Index and bloom are the
/// "important" categories: they stay cacheable even when a family disables
/// data block caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCategory {
    Data,
    Index,
    Bloom,
}

/// Admission priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePriority {
    Single,
    Multi,
    InMemory,
}

/// Cache key: which file, which block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCacheKey {
    pub file_id: u64,
    pub offset: u64,
}

struct CachedBlock {
    data: Arc<Vec<u8>>,
    category: BlockCategory,
    freq: u8,
}

#[derive(Default)]
struct Band {
    entries: HashMap<BlockCacheKey, CachedBlock>,
    clock: VecDeque<BlockCacheKey>,
    bytes: usize,
}

impl Band {
    fn insert(&mut self, key: BlockCacheKey, block: CachedBlock) {
        self.bytes += block.data.len();
        if let Some(old) = self.entries.insert(key, block) {
            self.bytes -= old.data.len();
        } else {
            self.clock.push_back(key);
        }
    }

    fn remove(&mut self, key: &BlockCacheKey) -> Option<CachedBlock> {
        let block = self.entries.remove(key)?;
        self.bytes -= block.data.len();
        self.clock.retain(|k| k != key);
        Some(block)
    }

    /// Pops one zero-frequency victim, aging entries the hand passes.
    fn evict_one(&mut self) -> Option<(BlockCacheKey, CachedBlock)> {
        for _ in 0..self.clock.len() {
            let key = self.clock.pop_front()?;
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.freq > 0 {
                entry.freq -= 1;
                self.clock.push_back(key);
            } else {
                let block = self.entries.remove(&key).expect("entry just observed");
                self.bytes -= block.data.len();
                return Some((key, block));
            }
        }
        // Every entry had residual frequency; drop the oldest outright.
        let key = self.clock.pop_front()?;
        let block = self.entries.remove(&key)?;
        self.bytes -= block.data.len();
        Some((key, block))
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    pub size: usize,
    pub free: usize,
    pub count: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub hit_percent: f64,
    pub caching_hit_percent: f64,
}

pub struct BlockCache {
    capacity: usize,
    band_floor: usize,
    single: Mutex<Band>,
    multi: Mutex<Band>,
    in_memory: Mutex<Band>,
    size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    caching_hits: AtomicU64,
    caching_requests: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            band_floor: (capacity as f64 * BAND_FLOOR_FRACTION) as usize,
            single: Mutex::new(Band::default()),
            multi: Mutex::new(Band::default()),
            in_memory: Mutex::new(Band::default()),
            size: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            caching_hits: AtomicU64::new(0),
            caching_requests: AtomicU64::new(0),
        }
    }

    /// Looks a block up. `caching` is whether the caller would cache the
    /// block on a miss; it feeds the caching-hit metric.
    pub fn get(&self, key: &BlockCacheKey, caching: bool) -> Option<Arc<Vec<u8>>> {
        if caching {
            self.caching_requests.fetch_add(1, Ordering::Relaxed);
        }

        // SINGLE hit promotes to MULTI.
        {
            let mut single = self.single.lock().expect("cache lock poisoned");
            if let Some(mut block) = single.remove(key) {
                let data = block.data.clone();
                block.freq = block.freq.saturating_add(1).min(MAX_FREQUENCY_LIMIT);
                drop(single);
                self.multi
                    .lock()
                    .expect("cache lock poisoned")
                    .insert(*key, block);
                self.record_hit(caching);
                return Some(data);
            }
        }

        for band in [&self.multi, &self.in_memory] {
            let mut band = band.lock().expect("cache lock poisoned");
            if let Some(entry) = band.entries.get_mut(key) {
                entry.freq = entry.freq.saturating_add(1).min(MAX_FREQUENCY_LIMIT);
                let data = entry.data.clone();
                self.record_hit(caching);
                return Some(data);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inserts a block at the given priority, evicting as needed.
    pub fn insert(
        &self,
        key: BlockCacheKey,
        category: BlockCategory,
        priority: CachePriority,
        data: Vec<u8>,
    ) {
        let len = data.len();
        let block = CachedBlock {
            data: Arc::new(data),
            category,
            freq: 0,
        };

        // Drop any prior copy of the block so size accounting stays exact.
        for band in [&self.single, &self.multi, &self.in_memory] {
            if let Some(old) = band.lock().expect("cache lock poisoned").remove(&key) {
                self.size.fetch_sub(old.data.len(), Ordering::Relaxed);
            }
        }

        let band = match priority {
            CachePriority::Single => &self.single,
            CachePriority::Multi => &self.multi,
            CachePriority::InMemory => &self.in_memory,
        };
        band.lock().expect("cache lock poisoned").insert(key, block);
        self.size.fetch_add(len, Ordering::Relaxed);

        self.evict_to_capacity();
    }

    fn evict_to_capacity(&self) {
        while self.size.load(Ordering::Relaxed) > self.capacity {
            let mut evicted = false;
            for band in [&self.single, &self.multi, &self.in_memory] {
                let mut band = band.lock().expect("cache lock poisoned");
                if band.bytes <= self.band_floor {
                    continue;
                }
                if let Some((_, block)) = band.evict_one() {
                    self.size.fetch_sub(block.data.len(), Ordering::Relaxed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted = true;
                    break;
                }
            }
            if !evicted {
                // Every band is at or under its floor; tolerate overshoot.
                break;
            }
        }
    }

    /// Removes every block belonging to a file. Called when the file is
    /// archived after compaction or split.
    pub fn invalidate_file(&self, file_id: u64) -> usize {
        let mut removed = 0;
        for band in [&self.single, &self.multi, &self.in_memory] {
            let mut band = band.lock().expect("cache lock poisoned");
            let victims: Vec<BlockCacheKey> = band
                .entries
                .keys()
                .filter(|k| k.file_id == file_id)
                .copied()
                .collect();
            for key in victims {
                if let Some(block) = band.remove(&key) {
                    self.size.fetch_sub(block.data.len(), Ordering::Relaxed);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Number of cached blocks in a category, optionally limited to one file.
    pub fn count_category(&self, category: BlockCategory, file_id: Option<u64>) -> usize {
        let mut count = 0;
        for band in [&self.single, &self.multi, &self.in_memory] {
            let band = band.lock().expect("cache lock poisoned");
            count += band
                .entries
                .iter()
                .filter(|(k, v)| {
                    v.category == category && file_id.map_or(true, |id| k.file_id == id)
                })
                .count();
        }
        count
    }

    pub fn metrics(&self) -> CacheMetrics {
        let size = self.size.load(Ordering::Relaxed);
        let count = [&self.single, &self.multi, &self.in_memory]
            .iter()
            .map(|b| b.lock().expect("cache lock poisoned").entries.len())
            .sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let caching_hits = self.caching_hits.load(Ordering::Relaxed);
        let caching_requests = self.caching_requests.load(Ordering::Relaxed);

        CacheMetrics {
            size,
            free: self.capacity.saturating_sub(size),
            count,
            hit_count: hits,
            miss_count: misses,
            eviction_count: self.evictions.load(Ordering::Relaxed),
            hit_percent: percent(hits, hits + misses),
            caching_hit_percent: percent(caching_hits, caching_requests),
        }
    }

    fn record_hit(&self, caching: bool) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if caching {
            self.caching_hits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file_id: u64, offset: u64) -> BlockCacheKey {
        BlockCacheKey { file_id, offset }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BlockCache::new(1024);
        cache.insert(key(1, 0), BlockCategory::Data, CachePriority::Single, vec![1; 16]);

        assert_eq!(
            cache.get(&key(1, 0), true).as_deref(),
            Some(&vec![1u8; 16])
        );
        assert!(cache.get(&key(1, 16), true).is_none());

        let metrics = cache.metrics();
        assert_eq!(metrics.hit_count, 1);
        assert_eq!(metrics.miss_count, 1);
        assert_eq!(metrics.size, 16);
    }

    #[test]
    fn test_promotion_to_multi() {
        let cache = BlockCache::new(1024);
        cache.insert(key(1, 0), BlockCategory::Data, CachePriority::Single, vec![0; 8]);

        // First hit moves the entry out of SINGLE.
        cache.get(&key(1, 0), false);
        assert_eq!(cache.single.lock().unwrap().entries.len(), 0);
        assert_eq!(cache.multi.lock().unwrap().entries.len(), 1);

        // Still retrievable afterwards.
        assert!(cache.get(&key(1, 0), false).is_some());
    }

    #[test]
    fn test_eviction_prefers_single_band() {
        let cache = BlockCache::new(256);
        // Pin an important block.
        cache.insert(key(9, 0), BlockCategory::Index, CachePriority::InMemory, vec![0; 64]);
        // Promote one data block to MULTI.
        cache.insert(key(1, 0), BlockCategory::Data, CachePriority::Single, vec![0; 64]);
        cache.get(&key(1, 0), false);

        // Flood SINGLE past capacity.
        for i in 0..8 {
            cache.insert(key(2, i * 64), BlockCategory::Data, CachePriority::Single, vec![0; 64]);
        }

        // The pinned and promoted blocks survive; evictions happened.
        assert!(cache.get(&key(9, 0), false).is_some());
        assert!(cache.get(&key(1, 0), false).is_some());
        assert!(cache.metrics().eviction_count > 0);
    }

    #[test]
    fn test_invalidate_file() {
        let cache = BlockCache::new(1024);
        cache.insert(key(1, 0), BlockCategory::Data, CachePriority::Single, vec![0; 8]);
        cache.insert(key(1, 8), BlockCategory::Index, CachePriority::InMemory, vec![0; 8]);
        cache.insert(key(2, 0), BlockCategory::Data, CachePriority::Single, vec![0; 8]);

        assert_eq!(cache.invalidate_file(1), 2);
        assert!(cache.get(&key(1, 0), false).is_none());
        assert!(cache.get(&key(2, 0), false).is_some());
        assert_eq!(cache.metrics().size, 8);
    }

    #[test]
    fn test_category_counts() {
        let cache = BlockCache::new(1024);
        cache.insert(key(3, 0), BlockCategory::Index, CachePriority::InMemory, vec![0; 8]);
        cache.insert(key(3, 8), BlockCategory::Bloom, CachePriority::InMemory, vec![0; 8]);
        cache.insert(key(3, 16), BlockCategory::Data, CachePriority::Single, vec![0; 8]);

        assert_eq!(cache.count_category(BlockCategory::Index, Some(3)), 1);
        assert_eq!(cache.count_category(BlockCategory::Bloom, Some(3)), 1);
        assert_eq!(cache.count_category(BlockCategory::Data, None), 1);
    }

    #[test]
    fn test_reinsert_updates_size() {
        let cache = BlockCache::new(1024);
        cache.insert(key(1, 0), BlockCategory::Data, CachePriority::Single, vec![0; 100]);
        cache.insert(key(1, 0), BlockCategory::Data, CachePriority::Single, vec![0; 10]);
        assert_eq!(cache.metrics().size, 10);
        assert_eq!(cache.metrics().count, 1);
    }
}
