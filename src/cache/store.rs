// Durable cache store: entry metadata and verified blob bytes in sled.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info};

use super::priority::PrioritySignals;
use crate::error::Result;
use crate::model::ReachLevel;

/// What survives a restart for one reach-aware cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub hash: String,
    pub size_bytes: u64,
    pub reach: ReachLevel,
    pub domain: String,
    pub epic: String,
    pub signals: PrioritySignals,
    pub access_count: u64,
    /// Wall-clock ms of the original insert.
    pub stored_at_ms: u64,
}

pub trait CacheStore: Send + Sync {
    fn save_entry(&self, entry: &PersistedEntry) -> Result<()>;
    fn remove_entry(&self, hash: &str) -> Result<()>;
    fn load_entries(&self) -> Result<Vec<PersistedEntry>>;
    fn save_blob(&self, hash: &str, data: &[u8]) -> Result<()>;
    fn load_blob(&self, hash: &str) -> Result<Option<Bytes>>;
    fn remove_blob(&self, hash: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

pub struct SledStore {
    db: Db,
    entries: Tree,
    blobs: Tree,
}

impl SledStore {
    /// Open or create the store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let entries = db.open_tree("entries")?;
        let blobs = db.open_tree("blobs")?;
        info!(path = %path.as_ref().display(), "opened cache store");
        Ok(Self { db, entries, blobs })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl CacheStore for SledStore {
    fn save_entry(&self, entry: &PersistedEntry) -> Result<()> {
        let value = serde_json::to_vec(entry)?;
        self.entries.insert(entry.hash.as_bytes(), value)?;
        Ok(())
    }

    fn remove_entry(&self, hash: &str) -> Result<()> {
        self.entries.remove(hash.as_bytes())?;
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<PersistedEntry>> {
        let mut out = Vec::with_capacity(self.entries.len());
        for item in self.entries.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        debug!("loaded {} persisted cache entries", out.len());
        Ok(out)
    }

    fn save_blob(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.blobs.insert(hash.as_bytes(), data)?;
        Ok(())
    }

    fn load_blob(&self, hash: &str) -> Result<Option<Bytes>> {
        Ok(self
            .blobs
            .get(hash.as_bytes())?
            .map(|v| Bytes::copy_from_slice(&v)))
    }

    fn remove_blob(&self, hash: &str) -> Result<()> {
        self.blobs.remove(hash.as_bytes())?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear()?;
        self.blobs.clear()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str) -> PersistedEntry {
        PersistedEntry {
            hash: hash.to_string(),
            size_bytes: 42,
            reach: ReachLevel::Local,
            domain: "elohim-protocol".to_string(),
            epic: "governance".to_string(),
            signals: PrioritySignals::default(),
            access_count: 3,
            stored_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_entries_and_blobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.save_entry(&entry("aa")).unwrap();
            store.save_entry(&entry("bb")).unwrap();
            store.save_blob("aa", b"blob bytes").unwrap();
            store.remove_entry("bb").unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        let loaded = store.load_entries().unwrap();
        assert_eq!(loaded, vec![entry("aa")]);
        assert_eq!(&store.load_blob("aa").unwrap().unwrap()[..], b"blob bytes");
        assert!(store.load_blob("bb").unwrap().is_none());

        store.clear().unwrap();
        assert_eq!(store.entry_count(), 0);
    }
}
