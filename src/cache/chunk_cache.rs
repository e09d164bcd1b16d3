// Short-lived cache of downloaded chunks, bounded by entry count and TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::CacheStats;

/// Chunk `index` of the blob identified by `blob_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub blob_hash: String,
    pub index: usize,
}

impl ChunkKey {
    pub fn new(blob_hash: impl Into<String>, index: usize) -> Self {
        Self {
            blob_hash: blob_hash.into(),
            index,
        }
    }
}

struct Slot {
    data: Bytes,
    inserted_at: Instant,
    insert_seq: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<ChunkKey, Slot>,
    /// insert_seq -> key; insertion order doubles as expiry order.
    by_age: BTreeMap<u64, ChunkKey>,
    total_bytes: u64,
    next_seq: u64,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
}

impl Inner {
    fn remove(&mut self, key: &ChunkKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.by_age.remove(&slot.insert_seq);
        self.total_bytes -= slot.data.len() as u64;
        Some(slot)
    }
}

pub struct ChunkCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
    shutdown: CancellationToken,
}

impl ChunkCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: max_entries.max(1),
            ttl,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn put(&self, key: ChunkKey, data: Bytes) {
        let mut inner = self.inner.lock();
        inner.remove(&key);

        while inner.slots.len() >= self.max_entries {
            let Some((_, oldest)) = inner.by_age.pop_first() else {
                break;
            };
            if let Some(slot) = inner.slots.remove(&oldest) {
                inner.total_bytes -= slot.data.len() as u64;
                inner.eviction_count += 1;
            }
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.total_bytes += data.len() as u64;
        inner.by_age.insert(seq, key.clone());
        inner.slots.insert(
            key,
            Slot {
                data,
                inserted_at: Instant::now(),
                insert_seq: seq,
            },
        );
    }

    pub fn get(&self, key: &ChunkKey) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let fresh = inner
            .slots
            .get(key)
            .map(|s| s.inserted_at.elapsed() <= self.ttl);
        match fresh {
            Some(true) => {
                inner.hit_count += 1;
                inner.slots.get(key).map(|s| s.data.clone())
            }
            Some(false) => {
                inner.remove(key);
                inner.eviction_count += 1;
                inner.miss_count += 1;
                None
            }
            None => {
                inner.miss_count += 1;
                None
            }
        }
    }

    pub fn has(&self, key: &ChunkKey) -> bool {
        self.inner
            .lock()
            .slots
            .get(key)
            .is_some_and(|s| s.inserted_at.elapsed() <= self.ttl)
    }

    /// Restart the TTL of a chunk.
    pub fn touch(&self, key: &ChunkKey) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.remove(key) else {
            return false;
        };
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.total_bytes += slot.data.len() as u64;
        inner.by_age.insert(seq, key.clone());
        inner.slots.insert(
            key.clone(),
            Slot {
                data: slot.data,
                inserted_at: Instant::now(),
                insert_seq: seq,
            },
        );
        true
    }

    pub fn delete(&self, key: &ChunkKey) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every chunk of `blob_hash`; returns how many were removed.
    pub fn delete_blob(&self, blob_hash: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<ChunkKey> = inner
            .slots
            .keys()
            .filter(|k| k.blob_hash == blob_hash)
            .cloned()
            .collect();
        for k in &keys {
            inner.remove(k);
        }
        keys.len()
    }

    /// Remove every chunk older than the TTL.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut cleaned = 0;
        while let Some((_, key)) = inner.by_age.first_key_value() {
            let expired = inner
                .slots
                .get(key)
                .map_or(true, |s| s.inserted_at.elapsed() > self.ttl);
            if !expired {
                break;
            }
            let key = key.clone();
            if inner.remove(&key).is_none() {
                inner.by_age.pop_first();
                continue;
            }
            inner.eviction_count += 1;
            cleaned += 1;
        }
        if cleaned > 0 {
            debug!("chunk cache cleanup removed {} expired chunks", cleaned);
        }
        cleaned
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` until disposed.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.cleanup_expired();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("chunk cache cleanup task stopped");
                        return;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            item_count: inner.slots.len(),
            total_size_bytes: inner.total_bytes,
            eviction_count: inner.eviction_count,
            hit_count: inner.hit_count,
            miss_count: inner.miss_count,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.by_age.clear();
        inner.total_bytes = 0;
    }

    /// Stop the cleanup task and drop all chunks.
    pub fn dispose(&self) {
        self.shutdown.cancel();
        *self.inner.lock() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> ChunkKey {
        ChunkKey::new("blob", i)
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let cache = ChunkCache::new(2, Duration::from_secs(60));
        cache.put(key(0), Bytes::from_static(b"zero"));
        cache.put(key(1), Bytes::from_static(b"one"));
        cache.put(key(2), Bytes::from_static(b"two"));

        assert!(!cache.has(&key(0)));
        assert_eq!(cache.get(&key(2)).unwrap(), Bytes::from_static(b"two"));
        assert_eq!(cache.stats().eviction_count, 1);
        assert_eq!(cache.delete_blob("blob"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_removes_expired() {
        let cache = Arc::new(ChunkCache::new(10, Duration::from_secs(5)));
        cache.put(key(0), Bytes::from_static(b"old"));
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.put(key(1), Bytes::from_static(b"young"));

        let handle = cache.spawn_cleanup(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(!cache.has(&key(0)));
        assert!(cache.has(&key(1)));
        assert_eq!(cache.stats().item_count, 1);

        cache.dispose();
        handle.await.unwrap();
        assert_eq!(cache.stats().item_count, 0);
    }
}
