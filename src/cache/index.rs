// Eviction-order index of one reach partition.

use std::collections::{BTreeSet, HashMap};

use tracing::info;

use crate::config::CacheBackendPreference;

/// Ordering of a partition's entries by (priority, last access).
///
/// `access_seq` is a process-wide counter: lower means less recently used.
pub trait PartitionIndex: Send + Sync {
    fn insert(&mut self, hash: &str, priority: i32, access_seq: u64);
    fn remove(&mut self, hash: &str);
    /// The entry that would be evicted next, without removing it.
    fn peek_victim(&self) -> Option<String>;
    fn len(&self) -> usize;
    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `BTreeSet`-ordered index: O(log n) insert, remove and victim lookup.
#[derive(Default)]
pub struct OrderedIndex {
    order: BTreeSet<(i32, u64, String)>,
    keys: HashMap<String, (i32, u64)>,
}

impl PartitionIndex for OrderedIndex {
    fn insert(&mut self, hash: &str, priority: i32, access_seq: u64) {
        self.remove(hash);
        self.order.insert((priority, access_seq, hash.to_string()));
        self.keys.insert(hash.to_string(), (priority, access_seq));
    }

    fn remove(&mut self, hash: &str) {
        if let Some((priority, seq)) = self.keys.remove(hash) {
            self.order.remove(&(priority, seq, hash.to_string()));
        }
    }

    fn peek_victim(&self) -> Option<String> {
        self.order.iter().next().map(|(_, _, h)| h.clone())
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}

/// Linear-scan index; the behavioural reference for [`OrderedIndex`].
#[derive(Default)]
pub struct ScanIndex {
    keys: HashMap<String, (i32, u64)>,
}

impl PartitionIndex for ScanIndex {
    fn insert(&mut self, hash: &str, priority: i32, access_seq: u64) {
        self.keys.insert(hash.to_string(), (priority, access_seq));
    }

    fn remove(&mut self, hash: &str) {
        self.keys.remove(hash);
    }

    fn peek_victim(&self) -> Option<String> {
        self.keys
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(h, _)| h.clone())
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Builds partition indexes of a single kind, chosen once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFactory {
    kind: IndexKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    Ordered,
    Scan,
}

impl IndexFactory {
    pub fn from_preference(pref: CacheBackendPreference) -> Self {
        let kind = match pref {
            CacheBackendPreference::Auto | CacheBackendPreference::Indexed => IndexKind::Ordered,
            CacheBackendPreference::Reference => IndexKind::Scan,
        };
        let factory = Self { kind };
        info!("reach cache index: {}", factory.implementation());
        factory
    }

    pub fn build(&self) -> Box<dyn PartitionIndex> {
        match self.kind {
            IndexKind::Ordered => Box::new(OrderedIndex::default()),
            IndexKind::Scan => Box::new(ScanIndex::default()),
        }
    }

    pub fn implementation(&self) -> &'static str {
        match self.kind {
            IndexKind::Ordered => "indexed",
            IndexKind::Scan => "reference",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(mut idx: Box<dyn PartitionIndex>) -> Vec<String> {
        idx.insert("a", 50, 1);
        idx.insert("b", 10, 2);
        idx.insert("c", 10, 3);
        idx.insert("d", 90, 4);
        // Re-inserting "b" with a newer access makes "c" the older of the tie.
        idx.insert("b", 10, 5);

        let mut order = Vec::new();
        while let Some(victim) = idx.peek_victim() {
            idx.remove(&victim);
            order.push(victim);
        }
        assert!(idx.is_empty());
        order
    }

    #[test]
    fn test_indexes_agree_on_eviction_order() {
        let expected = vec!["c", "b", "a", "d"];
        assert_eq!(exercise(Box::new(OrderedIndex::default())), expected);
        assert_eq!(exercise(Box::new(ScanIndex::default())), expected);
    }

    #[test]
    fn test_factory_reports_implementation() {
        assert_eq!(
            IndexFactory::from_preference(CacheBackendPreference::Auto).implementation(),
            "indexed"
        );
        assert_eq!(
            IndexFactory::from_preference(CacheBackendPreference::Reference).implementation(),
            "reference"
        );
    }
}
