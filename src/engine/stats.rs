// Transfer accounting for the engine: bytes moved, cache reuse and the
// throughput each source has delivered.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::cache::BandwidthClass;

/// Verified downloads from one source.
#[derive(Debug, Clone, Default)]
struct SourceThroughput {
    transfers: u64,
    bytes: u64,
    busy: Duration,
}

impl SourceThroughput {
    fn mbps(&self) -> Option<f64> {
        let secs = self.busy.as_secs_f64();
        (self.transfers > 0 && secs > 0.0).then(|| self.bytes as f64 * 8.0 / secs / 1_000_000.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub url: String,
    pub transfers: u64,
    pub bytes: u64,
    pub mbps: Option<f64>,
    pub class: Option<BandwidthClass>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_downloaded: u64,
    pub total_served: u64,
    pub active_workers: u32,
    pub failed_chunks: u64,
    /// Share of requested bytes that were satisfied from cache.
    pub cache_hit_rate: f64,
    /// Bytes over busy time across every source, `None` before the first transfer.
    pub download_mbps: Option<f64>,
    /// Fastest source first.
    pub sources: Vec<SourceReport>,
}

#[derive(Default)]
pub struct StatsCollector {
    downloaded: AtomicU64,
    served: AtomicU64,
    workers: AtomicU32,
    failed_chunks: AtomicU64,
    requested: AtomicU64,
    from_cache: AtomicU64,
    sources: DashMap<String, SourceThroughput>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_served(&self, bytes: u64) {
        self.served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// `total` bytes were asked for, `cached` of them came from a cache layer.
    pub fn record_request(&self, total: u64, cached: u64) {
        self.requested.fetch_add(total, Ordering::Relaxed);
        self.from_cache.fetch_add(cached, Ordering::Relaxed);
    }

    pub fn record_chunk_failure(&self) {
        self.failed_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// A verified blob of `bytes` arrived from `url` after `elapsed`.
    pub fn record_transfer(&self, url: &str, bytes: u64, elapsed: Duration) {
        let mut source = self.sources.entry(url.to_string()).or_default();
        source.transfers += 1;
        source.bytes += bytes;
        source.busy += elapsed;
    }

    /// Average throughput `url` has delivered so far.
    pub fn source_mbps(&self, url: &str) -> Option<f64> {
        self.sources.get(url)?.mbps()
    }

    pub fn source_class(&self, url: &str) -> Option<BandwidthClass> {
        self.source_mbps(url).map(BandwidthClass::from_mbps)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let requested = self.requested.load(Ordering::Relaxed);
        let from_cache = self.from_cache.load(Ordering::Relaxed);
        let cache_hit_rate = if requested > 0 {
            from_cache as f64 / requested as f64
        } else {
            0.0
        };

        let mut overall = SourceThroughput::default();
        let mut sources: Vec<SourceReport> = self
            .sources
            .iter()
            .map(|e| {
                overall.transfers += e.transfers;
                overall.bytes += e.bytes;
                overall.busy += e.busy;
                let mbps = e.mbps();
                SourceReport {
                    url: e.key().clone(),
                    transfers: e.transfers,
                    bytes: e.bytes,
                    mbps,
                    class: mbps.map(BandwidthClass::from_mbps),
                }
            })
            .collect();
        sources.sort_by(|a, b| b.mbps.unwrap_or(0.0).total_cmp(&a.mbps.unwrap_or(0.0)));

        StatsSnapshot {
            total_downloaded: self.total_downloaded(),
            total_served: self.served.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            failed_chunks: self.failed_chunks.load(Ordering::Relaxed),
            cache_hit_rate,
            download_mbps: overall.mbps(),
            sources,
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> u32 {
        self.workers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_reuse_and_worker_gauge() {
        let stats = StatsCollector::new();
        stats.record_request(4096, 1024);
        stats.record_request(4096, 0);
        stats.increment_workers();
        stats.record_chunk_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hit_rate, 0.125);
        assert_eq!((snap.active_workers, snap.failed_chunks), (1, 1));
        assert!(snap.download_mbps.is_none());
        assert!(snap.sources.is_empty());
    }

    #[test]
    fn test_source_throughput_is_classified() {
        let stats = StatsCollector::new();
        // 12.5 MB in one second = 100 Mbps.
        stats.record_transfer("http://fast/blob", 12_500_000, Duration::from_secs(1));
        // 1 MB over two transfers totalling two seconds = 4 Mbps.
        stats.record_transfer("http://slow/blob", 500_000, Duration::from_secs(1));
        stats.record_transfer("http://slow/blob", 500_000, Duration::from_secs(1));

        assert_eq!(stats.source_class("http://fast/blob"), Some(BandwidthClass::Ultra));
        assert_eq!(stats.source_class("http://slow/blob"), Some(BandwidthClass::Low));
        assert!((stats.source_mbps("http://slow/blob").unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(stats.source_class("http://unknown/blob"), None);

        let snap = stats.snapshot();
        assert_eq!(snap.sources[0].url, "http://fast/blob");
        assert_eq!(snap.sources[1].transfers, 2);
        // 13.5 MB over three seconds.
        assert!((snap.download_mbps.unwrap() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_instant_transfer_has_no_rate() {
        let stats = StatsCollector::new();
        stats.record_transfer("http://local/blob", 1024, Duration::ZERO);
        assert_eq!(stats.source_mbps("http://local/blob"), None);
    }
}
