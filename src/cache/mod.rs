// Reach-aware metadata cache, byte caches and the durable store behind them.

pub mod blob_cache;
pub mod chunk_cache;
pub mod index;
pub mod priority;
pub mod reach_aware;
pub mod store;

use serde::Serialize;

pub use blob_cache::BlobCache;
pub use chunk_cache::{ChunkCache, ChunkKey};
pub use priority::{priority_score, BandwidthClass, PrioritySignals, StewardTier};
pub use reach_aware::{CacheEntry, CacheQuery, ReachAwareCache};
pub use store::{CacheStore, PersistedEntry, SledStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub item_count: usize,
    pub total_size_bytes: u64,
    pub eviction_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

impl CacheStats {
    pub fn merge(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            item_count: self.item_count + other.item_count,
            total_size_bytes: self.total_size_bytes + other.total_size_bytes,
            eviction_count: self.eviction_count + other.eviction_count,
            hit_count: self.hit_count + other.hit_count,
            miss_count: self.miss_count + other.miss_count,
        }
    }
}
