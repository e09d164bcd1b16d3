use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BlobError, Result};

/// Base delay before the first retry of a fallback URL; doubles on every retry.
pub const BACKOFF_BASE_MS: u64 = 100;

/// Default per-attempt timeout for whole-blob fetches.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Default retries per fallback URL (after the first attempt).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default size of a ranged chunk (5 MiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 5 * 1024 * 1024;

/// Blobs smaller than this are always fetched whole (10 MiB).
pub const CHUNKED_DOWNLOAD_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Default bandwidth probe sample (256 KiB).
pub const DEFAULT_PROBE_SAMPLE_BYTES: u64 = 256 * 1024;

/// How long a bandwidth probe result stays valid for its URL.
pub const PROBE_CACHE_TTL_SECS: u64 = 10 * 60;

/// Fraction of the measured average used to bracket min/max probe speeds.
pub const PROBE_UNCERTAINTY: f64 = 0.2;

/// Number of reach partitions (private..commons).
pub const REACH_LEVEL_COUNT: usize = 8;

/// Top-level configuration for the distribution engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fetch: FetchConfig,
    pub chunking: ChunkingConfig,
    pub probe: ProbeConfig,
    pub custodian: CustodianConfig,
    pub cache: CacheConfig,
    pub bootstrap: BootstrapConfig,
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| BlobError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BlobError::Config(format!("read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries per URL after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: BACKOFF_BASE_MS,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size_bytes: u64,
    pub max_parallel_chunks: usize,
    pub chunk_timeout_ms: u64,
    /// Blobs below this size skip the chunked path entirely.
    pub min_chunked_size_bytes: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            max_parallel_chunks: 4,
            chunk_timeout_ms: 30_000,
            min_chunked_size_bytes: CHUNKED_DOWNLOAD_THRESHOLD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub sample_size_bytes: u64,
    pub cache_ttl_secs: u64,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sample_size_bytes: DEFAULT_PROBE_SAMPLE_BYTES,
            cache_ttl_secs: PROBE_CACHE_TTL_SECS,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CustodianConfig {
    pub default_ttl_days: u32,
    pub default_max_custodians: usize,
    /// Interval of the background TTL sweep and health probe cycle.
    pub maintenance_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub target_replicas: usize,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            default_ttl_days: 30,
            default_max_custodians: 5,
            maintenance_interval_secs: 60,
            probe_timeout_ms: 5_000,
            target_replicas: 3,
        }
    }
}

impl CustodianConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Which partition index implementation the reach-aware cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendPreference {
    #[default]
    Auto,
    Indexed,
    Reference,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of every reach partition.
    pub max_bytes_per_reach: u64,
    pub blob_cache_max_bytes: u64,
    pub blob_ttl_secs: u64,
    pub chunk_cache_max_entries: usize,
    pub chunk_ttl_secs: u64,
    pub chunk_cleanup_interval_secs: u64,
    pub backend: CacheBackendPreference,
    /// Directory of the durable store. `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_reach: 512 * 1024 * 1024,
            blob_cache_max_bytes: 1024 * 1024 * 1024,
            blob_ttl_secs: 24 * 60 * 60,
            chunk_cache_max_entries: 256,
            chunk_ttl_secs: 5 * 60,
            chunk_cleanup_interval_secs: 60,
            backend: CacheBackendPreference::Auto,
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Base URLs probed for liveness before the engine reports ready.
    pub source_urls: Vec<String>,
    pub source_wait_attempts: u32,
    pub source_wait_backoff_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            source_urls: Vec::new(),
            source_wait_attempts: 5,
            source_wait_backoff_ms: 500,
        }
    }
}
