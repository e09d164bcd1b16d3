// In-memory LRU of verified blob bytes, bounded by total size and entry age.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::CacheStats;
use crate::error::{BlobError, Result};

struct Slot {
    data: Bytes,
    inserted_at: Instant,
    access_seq: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    /// access_seq -> hash, oldest first.
    lru: BTreeMap<u64, String>,
    total_bytes: u64,
    next_seq: u64,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, hash: &str) -> Option<Slot> {
        let slot = self.slots.remove(hash)?;
        self.lru.remove(&slot.access_seq);
        self.total_bytes -= slot.data.len() as u64;
        Some(slot)
    }
}

pub struct BlobCache {
    inner: Mutex<Inner>,
    max_bytes: u64,
    ttl: Duration,
}

impl BlobCache {
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes,
            ttl,
        }
    }

    /// Store `data` under `hash`, evicting least-recently-used blobs as needed.
    /// Returns how many blobs were evicted.
    pub fn put(&self, hash: &str, data: Bytes) -> Result<usize> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(BlobError::Input(format!(
                "blob {} of {} bytes exceeds cache capacity of {} bytes",
                hash, size, self.max_bytes
            )));
        }

        let mut inner = self.inner.lock();
        inner.remove(hash);

        let mut evicted = 0;
        while inner.total_bytes + size > self.max_bytes {
            let Some((_, victim)) = inner.lru.pop_first() else {
                break;
            };
            if let Some(slot) = inner.slots.remove(&victim) {
                inner.total_bytes -= slot.data.len() as u64;
                inner.eviction_count += 1;
                evicted += 1;
            }
        }

        let seq = inner.bump();
        inner.lru.insert(seq, hash.to_string());
        inner.total_bytes += size;
        inner.slots.insert(
            hash.to_string(),
            Slot {
                data,
                inserted_at: Instant::now(),
                access_seq: seq,
            },
        );
        if evicted > 0 {
            debug!("blob cache evicted {} entries for {}", evicted, hash);
        }
        Ok(evicted)
    }

    /// Bytes for `hash` unless absent or older than the TTL.
    pub fn get(&self, hash: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let expired = match inner.slots.get(hash) {
            None => {
                inner.miss_count += 1;
                return None;
            }
            Some(slot) => slot.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            inner.remove(hash);
            inner.eviction_count += 1;
            inner.miss_count += 1;
            return None;
        }

        let seq = inner.bump();
        let slot = inner.slots.get_mut(hash)?;
        let old_seq = std::mem::replace(&mut slot.access_seq, seq);
        let data = slot.data.clone();
        inner.lru.remove(&old_seq);
        inner.lru.insert(seq, hash.to_string());
        inner.hit_count += 1;
        Some(data)
    }

    pub fn has(&self, hash: &str) -> bool {
        self.inner
            .lock()
            .slots
            .get(hash)
            .is_some_and(|s| s.inserted_at.elapsed() <= self.ttl)
    }

    pub fn touch(&self, hash: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.slots.contains_key(hash) {
            return false;
        }
        let seq = inner.bump();
        let Some(slot) = inner.slots.get_mut(hash) else {
            return false;
        };
        let old_seq = std::mem::replace(&mut slot.access_seq, seq);
        inner.lru.remove(&old_seq);
        inner.lru.insert(seq, hash.to_string());
        true
    }

    pub fn delete(&self, hash: &str) -> bool {
        self.inner.lock().remove(hash).is_some()
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
        inner.lru.clear();
        inner.total_bytes = 0;
    }

    pub fn dispose(&self) {
        *self.inner.lock() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(n: usize) -> Bytes {
        Bytes::from(vec![1u8; n])
    }

    #[test]
    fn test_lru_eviction_respects_recent_access() {
        let cache = BlobCache::new(100, Duration::from_secs(60));
        cache.put("a", blob(40)).unwrap();
        cache.put("b", blob(40)).unwrap();
        assert!(cache.get("a").is_some());

        assert_eq!(cache.put("c", blob(40)).unwrap(), 1);
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert_eq!(cache.stats().total_size_bytes, 80);
    }

    #[test]
    fn test_oversized_blob_rejected() {
        let cache = BlobCache::new(10, Duration::from_secs(60));
        assert!(matches!(cache.put("big", blob(11)), Err(BlobError::Input(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_blob_is_a_miss() {
        let cache = BlobCache::new(100, Duration::from_secs(5));
        cache.put("a", blob(10)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!cache.has("a"));
        assert!(cache.get("a").is_none());
        let stats = cache.stats();
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.miss_count, 1);
    }
}
