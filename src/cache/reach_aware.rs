// Priority-scored cache partitioned by reach level; eviction never crosses partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::index::{IndexFactory, PartitionIndex};
use super::priority::{priority_score, PrioritySignals};
use super::store::{CacheStore, PersistedEntry};
use super::CacheStats;
use crate::config::{CacheConfig, REACH_LEVEL_COUNT};
use crate::error::{BlobError, Result};
use crate::model::ReachLevel;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub hash: String,
    pub size_bytes: u64,
    pub reach: ReachLevel,
    pub domain: String,
    pub epic: String,
    pub priority: i32,
    pub signals: PrioritySignals,
    pub access_count: u64,
    pub stored_at_ms: u64,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub last_accessed: Instant,
    #[serde(skip)]
    access_seq: u64,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
            reach: self.reach,
            domain: self.domain.clone(),
            epic: self.epic.clone(),
            signals: self.signals.clone(),
            access_count: self.access_count,
            stored_at_ms: self.stored_at_ms,
        }
    }
}

struct Partition {
    index: Box<dyn PartitionIndex>,
    total_bytes: u64,
    eviction_count: u64,
    hit_count: u64,
}

impl Partition {
    fn stats(&self) -> CacheStats {
        CacheStats {
            item_count: self.index.len(),
            total_size_bytes: self.total_bytes,
            eviction_count: self.eviction_count,
            hit_count: self.hit_count,
            miss_count: 0,
        }
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    partitions: Vec<Partition>,
    by_domain_epic: HashMap<(String, String), HashSet<String>>,
    miss_count: u64,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Drop `hash` from every structure; returns the removed entry.
    fn unlink(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        let partition = &mut self.partitions[entry.reach.index()];
        partition.index.remove(hash);
        partition.total_bytes -= entry.size_bytes;

        let key = (entry.domain.clone(), entry.epic.clone());
        if let Some(set) = self.by_domain_epic.get_mut(&key) {
            set.remove(hash);
            if set.is_empty() {
                self.by_domain_epic.remove(&key);
            }
        }
        Some(entry)
    }

    fn link(&mut self, entry: CacheEntry) {
        let partition = &mut self.partitions[entry.reach.index()];
        partition
            .index
            .insert(&entry.hash, entry.priority, entry.access_seq);
        partition.total_bytes += entry.size_bytes;
        self.by_domain_epic
            .entry((entry.domain.clone(), entry.epic.clone()))
            .or_default()
            .insert(entry.hash.clone());
        self.entries.insert(entry.hash.clone(), entry);
    }

    /// Evict from `reach` until `incoming` more bytes fit in `budget`.
    fn make_room(&mut self, reach: ReachLevel, incoming: u64, budget: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        loop {
            let partition = &self.partitions[reach.index()];
            if partition.total_bytes + incoming <= budget {
                break;
            }
            let Some(victim) = partition.index.peek_victim() else {
                break;
            };
            self.unlink(&victim);
            self.partitions[reach.index()].eviction_count += 1;
            evicted.push(victim);
        }
        evicted
    }
}

/// Filter over cached entries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct CacheQuery {
    reach: Option<ReachLevel>,
    domain: Option<String>,
    epic: Option<String>,
    min_priority: Option<i32>,
    limit: Option<usize>,
}

impl CacheQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reach(mut self, reach: ReachLevel) -> Self {
        self.reach = Some(reach);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn epic(mut self, epic: impl Into<String>) -> Self {
        self.epic = Some(epic.into());
        self
    }

    pub fn min_priority(mut self, priority: i32) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &CacheEntry) -> bool {
        self.reach.map_or(true, |r| entry.reach == r)
            && self.domain.as_deref().map_or(true, |d| entry.domain == d)
            && self.epic.as_deref().map_or(true, |e| entry.epic == e)
            && self.min_priority.map_or(true, |p| entry.priority >= p)
    }
}

fn by_priority(a: &CacheEntry, b: &CacheEntry) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.hash.cmp(&b.hash))
}

pub struct ReachAwareCache {
    inner: Mutex<Inner>,
    max_bytes_per_reach: u64,
    factory: IndexFactory,
    store: Option<Arc<dyn CacheStore>>,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ReachAwareCache {
    pub fn new(config: &CacheConfig) -> Self {
        let factory = IndexFactory::from_preference(config.backend);
        let partitions = (0..REACH_LEVEL_COUNT)
            .map(|_| Partition {
                index: factory.build(),
                total_bytes: 0,
                eviction_count: 0,
                hit_count: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                partitions,
                by_domain_epic: HashMap::new(),
                miss_count: 0,
                next_seq: 0,
            }),
            max_bytes_per_reach: config.max_bytes_per_reach,
            factory,
            store: None,
        }
    }

    /// Write entry metadata through to `store`.
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Name of the partition index in use (`indexed` or `reference`).
    pub fn implementation(&self) -> &'static str {
        self.factory.implementation()
    }

    pub fn max_bytes_per_reach(&self) -> u64 {
        self.max_bytes_per_reach
    }

    /// Insert or update an entry, evicting lower-priority entries of the same reach.
    /// Returns the evicted hashes.
    pub fn put(
        &self,
        hash: &str,
        size_bytes: u64,
        reach: ReachLevel,
        domain: &str,
        epic: &str,
        signals: PrioritySignals,
    ) -> Result<Vec<String>> {
        if size_bytes > self.max_bytes_per_reach {
            return Err(BlobError::Input(format!(
                "entry {} of {} bytes exceeds the {} partition budget of {} bytes",
                hash,
                size_bytes,
                reach.as_str(),
                self.max_bytes_per_reach
            )));
        }

        let priority = priority_score(reach, &signals);
        let (persisted, evicted) = {
            let mut inner = self.inner.lock();
            let previous = inner.unlink(hash);
            let evicted = inner.make_room(reach, size_bytes, self.max_bytes_per_reach);

            let now = Instant::now();
            let seq = inner.next_seq();
            let entry = CacheEntry {
                hash: hash.to_string(),
                size_bytes,
                reach,
                domain: domain.to_string(),
                epic: epic.to_string(),
                priority,
                signals,
                access_count: previous.as_ref().map_or(0, |p| p.access_count),
                stored_at_ms: previous
                    .as_ref()
                    .map_or_else(wall_clock_ms, |p| p.stored_at_ms),
                created_at: previous.as_ref().map_or(now, |p| p.created_at),
                last_accessed: now,
                access_seq: seq,
            };
            let persisted = entry.to_persisted();
            inner.link(entry);
            (persisted, evicted)
        };

        debug!(
            "cache put hash={} reach={} priority={} evicted={}",
            hash,
            reach.as_str(),
            priority,
            evicted.len()
        );
        if let Some(store) = &self.store {
            if let Err(e) = store.save_entry(&persisted) {
                warn!("cache store write failed hash={}: {}", hash, e);
            }
            for victim in &evicted {
                if let Err(e) = store.remove_entry(victim).and_then(|_| store.remove_blob(victim)) {
                    warn!("cache store evict failed hash={}: {}", victim, e);
                }
            }
        }
        Ok(evicted)
    }

    pub fn has(&self, hash: &str) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    /// Look up an entry and count it as an access.
    pub fn get(&self, hash: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(hash) {
            inner.miss_count += 1;
            return None;
        }
        let seq = inner.next_seq();
        let entry = inner.entries.get_mut(hash)?;
        entry.access_count += 1;
        entry.last_accessed = Instant::now();
        entry.access_seq = seq;
        let snapshot = entry.clone();

        let partition = &mut inner.partitions[snapshot.reach.index()];
        partition.hit_count += 1;
        partition.index.insert(hash, snapshot.priority, seq);
        Some(snapshot)
    }

    /// Mark an entry as recently used. Returns false when absent.
    pub fn touch(&self, hash: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(hash) {
            return false;
        }
        let seq = inner.next_seq();
        let Some(entry) = inner.entries.get_mut(hash) else {
            return false;
        };
        entry.access_count += 1;
        entry.last_accessed = Instant::now();
        entry.access_seq = seq;
        let (reach, priority) = (entry.reach, entry.priority);
        inner.partitions[reach.index()]
            .index
            .insert(hash, priority, seq);
        true
    }

    pub fn delete(&self, hash: &str) -> bool {
        let removed = self.inner.lock().unlink(hash).is_some();
        if removed {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove_entry(hash) {
                    warn!("cache store delete failed hash={}: {}", hash, e);
                }
            }
        }
        removed
    }

    pub fn stats(&self, reach: ReachLevel) -> CacheStats {
        self.inner.lock().partitions[reach.index()].stats()
    }

    pub fn global_stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut total = inner
            .partitions
            .iter()
            .map(Partition::stats)
            .fold(CacheStats::default(), |acc, s| acc.merge(&s));
        total.miss_count = inner.miss_count;
        total
    }

    /// Entries tagged with `domain` and `epic`, highest priority first.
    pub fn query_by_domain_epic(&self, domain: &str, epic: &str) -> Vec<CacheEntry> {
        let inner = self.inner.lock();
        let key = (domain.to_string(), epic.to_string());
        let mut found: Vec<CacheEntry> = inner
            .by_domain_epic
            .get(&key)
            .map(|set| {
                set.iter()
                    .filter_map(|h| inner.entries.get(h).cloned())
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(by_priority);
        found
    }

    /// Entries matching `query`, highest priority first.
    pub fn query(&self, query: &CacheQuery) -> Vec<CacheEntry> {
        let inner = self.inner.lock();
        let mut found: Vec<CacheEntry> = match (&query.domain, &query.epic) {
            (Some(domain), Some(epic)) => inner
                .by_domain_epic
                .get(&(domain.clone(), epic.clone()))
                .into_iter()
                .flatten()
                .filter_map(|h| inner.entries.get(h))
                .filter(|e| query.matches(e))
                .cloned()
                .collect(),
            _ => inner
                .entries
                .values()
                .filter(|e| query.matches(e))
                .cloned()
                .collect(),
        };
        found.sort_by(by_priority);
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        found
    }

    /// Remove every entry, including persisted metadata.
    pub fn clear(&self) {
        self.reset();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                warn!("cache store clear failed: {}", e);
            }
        }
    }

    /// Release in-memory state; persisted entries stay for the next start.
    pub fn dispose(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                warn!("cache store flush failed: {}", e);
            }
        }
        self.reset();
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_domain_epic.clear();
        inner.miss_count = 0;
        for p in inner.partitions.iter_mut() {
            p.index.clear();
            p.total_bytes = 0;
            p.eviction_count = 0;
            p.hit_count = 0;
        }
    }

    /// Reload persisted entries, oldest first so they are evicted first.
    pub fn restore_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut persisted = store.load_entries()?;
        persisted.sort_by_key(|e| e.stored_at_ms);

        let mut inner = self.inner.lock();
        let mut restored = 0;
        for p in persisted {
            if p.size_bytes > self.max_bytes_per_reach {
                continue;
            }
            inner.unlink(&p.hash);
            inner.make_room(p.reach, p.size_bytes, self.max_bytes_per_reach);
            let now = Instant::now();
            let seq = inner.next_seq();
            inner.link(CacheEntry {
                priority: priority_score(p.reach, &p.signals),
                hash: p.hash,
                size_bytes: p.size_bytes,
                reach: p.reach,
                domain: p.domain,
                epic: p.epic,
                signals: p.signals,
                access_count: p.access_count,
                stored_at_ms: p.stored_at_ms,
                created_at: now,
                last_accessed: now,
                access_seq: seq,
            });
            restored += 1;
        }
        info!("restored {} cache entries from store", restored);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::priority::StewardTier;
    use crate::config::CacheBackendPreference;

    fn cache(budget: u64, backend: CacheBackendPreference) -> ReachAwareCache {
        ReachAwareCache::new(&CacheConfig {
            max_bytes_per_reach: budget,
            backend,
            ..Default::default()
        })
    }

    fn put(c: &ReachAwareCache, hash: &str, size: u64, reach: ReachLevel) -> Vec<String> {
        c.put(hash, size, reach, "d", "e", PrioritySignals::default())
            .unwrap()
    }

    #[test]
    fn test_query_filters_by_reach_topic_and_priority() {
        let c = cache(1_000, CacheBackendPreference::Auto);
        let curated = PrioritySignals {
            steward_tier: Some(StewardTier::Expert),
            ..Default::default()
        };
        c.put("a", 10, ReachLevel::Commons, "physics", "optics", curated.clone())
            .unwrap();
        c.put("b", 10, ReachLevel::Commons, "physics", "optics", PrioritySignals::default())
            .unwrap();
        c.put("c", 10, ReachLevel::Local, "physics", "optics", curated)
            .unwrap();
        c.put("d", 10, ReachLevel::Commons, "music", "rhythm", PrioritySignals::default())
            .unwrap();

        let hashes = |q: CacheQuery| -> Vec<String> {
            c.query(&q).into_iter().map(|e| e.hash).collect()
        };
        // Commons scores 84, plus 30 for an expert steward.
        assert_eq!(
            hashes(CacheQuery::new().domain("physics").epic("optics")),
            vec!["a", "b", "c"]
        );
        let commons = CacheQuery::new().reach(ReachLevel::Commons);
        assert_eq!(hashes(commons.min_priority(85)), vec!["a"]);
        assert_eq!(hashes(CacheQuery::new().domain("music")), vec!["d"]);
        assert_eq!(hashes(CacheQuery::new().min_priority(50).limit(2)), vec!["a", "b"]);
        assert!(hashes(CacheQuery::new().epic("optics").reach(ReachLevel::Private)).is_empty());
    }

    #[test]
    fn test_eviction_is_isolated_per_reach() {
        for backend in [CacheBackendPreference::Indexed, CacheBackendPreference::Reference] {
            let c = cache(100, backend);
            put(&c, "private-1", 60, ReachLevel::Private);
            put(&c, "commons-1", 60, ReachLevel::Commons);
            let evicted = put(&c, "commons-2", 60, ReachLevel::Commons);

            assert_eq!(evicted, vec!["commons-1"]);
            assert!(c.has("private-1"));
            assert_eq!(c.stats(ReachLevel::Private).item_count, 1);
            assert_eq!(c.stats(ReachLevel::Commons).eviction_count, 1);
        }
    }

    #[test]
    fn test_lowest_priority_then_least_recent_goes_first() {
        let c = cache(100, CacheBackendPreference::Auto);
        let vip = PrioritySignals {
            steward_tier: Some(StewardTier::Pioneer),
            ..Default::default()
        };
        c.put("vip", 40, ReachLevel::Local, "d", "e", vip).unwrap();
        put(&c, "old", 30, ReachLevel::Local);
        put(&c, "new", 30, ReachLevel::Local);
        assert!(c.touch("old"));

        let evicted = put(&c, "incoming", 30, ReachLevel::Local);
        assert_eq!(evicted, vec!["new"]);
        assert!(c.has("vip"));
        assert!(c.has("old"));
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let c = cache(100, CacheBackendPreference::Auto);
        let err = c
            .put("huge", 101, ReachLevel::Commons, "d", "e", PrioritySignals::default())
            .unwrap_err();
        assert!(matches!(err, BlobError::Input(_)));
        assert!(!c.has("huge"));
    }

    #[test]
    fn test_reput_moves_between_partitions() {
        let c = cache(100, CacheBackendPreference::Auto);
        put(&c, "h", 10, ReachLevel::Private);
        put(&c, "h", 10, ReachLevel::Commons);
        assert_eq!(c.stats(ReachLevel::Private).item_count, 0);
        assert_eq!(c.stats(ReachLevel::Commons).total_size_bytes, 10);
        assert_eq!(c.global_stats().item_count, 1);
    }

    #[test]
    fn test_hits_misses_and_domain_query() {
        let c = cache(1000, CacheBackendPreference::Auto);
        c.put("a", 1, ReachLevel::Commons, "fct", "governance", PrioritySignals::default())
            .unwrap();
        c.put("b", 1, ReachLevel::Private, "fct", "governance", PrioritySignals::default())
            .unwrap();
        c.put("c", 1, ReachLevel::Commons, "fct", "other", PrioritySignals::default())
            .unwrap();

        assert_eq!(c.get("a").unwrap().access_count, 1);
        assert!(c.get("zzz").is_none());
        let g = c.global_stats();
        assert_eq!((g.hit_count, g.miss_count), (1, 1));

        let found: Vec<String> = c
            .query_by_domain_epic("fct", "governance")
            .into_iter()
            .map(|e| e.hash)
            .collect();
        assert_eq!(found, vec!["a", "b"]);

        assert!(c.delete("a"));
        assert!(!c.delete("a"));
        c.clear();
        assert_eq!(c.global_stats().item_count, 0);
        assert!(c.query_by_domain_epic("fct", "other").is_empty());
    }
}
