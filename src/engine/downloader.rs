// Multi-connection chunk downloader: fetches byte ranges of a blob in parallel
// and reassembles them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::StatsCollector;
use crate::cache::{ChunkCache, ChunkKey};
use crate::config::ChunkingConfig;
use crate::error::{BlobError, Result};
use crate::model::ContentBlob;
use crate::source::traits::BlobTransport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkValidation {
    pub is_valid: bool,
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub missing_chunk_indices: Vec<usize>,
    pub failed_chunk_indices: Vec<usize>,
    pub chunk_errors: BTreeMap<usize, String>,
    pub expected_size_bytes: u64,
    pub actual_size_bytes: u64,
}

/// Check that chunks `0..total_chunks` are all present and add up to `expected_size_bytes`.
pub fn validate_chunks(
    chunks: &BTreeMap<usize, Bytes>,
    total_chunks: usize,
    expected_size_bytes: u64,
    chunk_errors: &BTreeMap<usize, String>,
) -> ChunkValidation {
    let missing_chunk_indices: Vec<usize> =
        (0..total_chunks).filter(|i| !chunks.contains_key(i)).collect();
    let actual_size_bytes: u64 = chunks.values().map(|c| c.len() as u64).sum();

    let is_valid = missing_chunk_indices.is_empty()
        && chunks.len() == total_chunks
        && actual_size_bytes == expected_size_bytes;

    ChunkValidation {
        is_valid,
        total_chunks,
        successful_chunks: chunks.len(),
        missing_chunk_indices,
        failed_chunk_indices: chunk_errors.keys().copied().collect(),
        chunk_errors: chunk_errors.clone(),
        expected_size_bytes,
        actual_size_bytes,
    }
}

pub fn format_validation_error(result: &ChunkValidation) -> String {
    if result.is_valid {
        return "All chunks validated successfully".to_string();
    }

    let mut parts = Vec::new();
    if !result.missing_chunk_indices.is_empty() {
        parts.push(format!("Missing chunks: {:?}", result.missing_chunk_indices));
    }
    if !result.failed_chunk_indices.is_empty() {
        parts.push(format!("Failed chunks: {}", result.failed_chunk_indices.len()));
    }
    if result.actual_size_bytes != result.expected_size_bytes {
        parts.push(format!(
            "Size mismatch: expected {} bytes, got {} bytes",
            result.expected_size_bytes, result.actual_size_bytes
        ));
    }
    if parts.is_empty() {
        parts.push(format!(
            "Chunk count mismatch: expected {}, got {}",
            result.total_chunks, result.successful_chunks
        ));
    }
    parts.join("; ")
}

/// Inclusive byte ranges covering `size` in pieces of `chunk_size`.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < size {
        let end = (start + chunk_size).min(size) - 1;
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

pub struct ChunkedDownloader {
    transport: Arc<dyn BlobTransport>,
    chunk_cache: Arc<ChunkCache>,
    stats: Arc<StatsCollector>,
    config: ChunkingConfig,
    shutdown_token: CancellationToken,
}

impl ChunkedDownloader {
    pub fn new(
        transport: Arc<dyn BlobTransport>,
        chunk_cache: Arc<ChunkCache>,
        stats: Arc<StatsCollector>,
        config: ChunkingConfig,
    ) -> Self {
        Self {
            transport,
            chunk_cache,
            stats,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Abort in-flight chunk fetches and refuse new downloads.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// True only when the source answers a one-byte ranged GET with 206.
    pub async fn check_range_support(&self, url: &str) -> bool {
        match self.transport.probe(url).await {
            Ok(info) => {
                debug!(
                    "range probe url={} supports_range={} length={}",
                    url, info.supports_range, info.content_length
                );
                info.supports_range
            }
            Err(e) => {
                warn!("range probe failed url={}: {}", url, e);
                false
            }
        }
    }

    /// Download `blob` from `url`, in parallel ranges when the source allows it.
    pub async fn download_in_chunks(&self, blob: &ContentBlob, url: &str) -> Result<Bytes> {
        if self.shutdown_token.is_cancelled() {
            return Err(BlobError::Unavailable("downloader shut down".to_string()));
        }
        if self.check_range_support(url).await {
            self.download_ranged(blob, url).await
        } else {
            info!("source lacks range support, fetching whole blob url={}", url);
            self.download_whole(blob, url).await
        }
    }

    /// Single GET of the whole blob, bounded by the time the chunked path
    /// would allow for the same number of chunks.
    async fn download_whole(&self, blob: &ContentBlob, url: &str) -> Result<Bytes> {
        let chunk_count = blob.size_bytes.div_ceil(self.config.chunk_size_bytes.max(1)).max(1);
        let timeout_ms = self.config.chunk_timeout_ms.saturating_mul(chunk_count);
        let bounded =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.transport.fetch(url));
        let data = tokio::select! {
            fetched = bounded => {
                match fetched {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => return Err(BlobError::Network(e.to_string())),
                    Err(_) => return Err(BlobError::Timeout(timeout_ms)),
                }
            }
            _ = self.shutdown_token.cancelled() => {
                return Err(BlobError::Unavailable("downloader shut down".to_string()));
            }
        };
        self.stats.record_downloaded(data.len() as u64);
        self.stats.record_request(data.len() as u64, 0);
        Ok(data)
    }

    /// Parallel ranged download of `blob` from a source already known to honour
    /// ranges. Chunks cached by an earlier pass are reused.
    pub async fn download_ranged(&self, blob: &ContentBlob, url: &str) -> Result<Bytes> {
        if self.shutdown_token.is_cancelled() {
            return Err(BlobError::Unavailable("downloader shut down".to_string()));
        }

        let ranges = plan_chunks(blob.size_bytes, self.config.chunk_size_bytes);
        let total_chunks = ranges.len();
        let mut chunks: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut chunk_errors: BTreeMap<usize, String> = BTreeMap::new();
        let mut done = bitvec![0; total_chunks];
        let mut reused_bytes = 0u64;

        for index in 0..total_chunks {
            if let Some(data) = self.chunk_cache.get(&ChunkKey::new(&blob.hash, index)) {
                reused_bytes += data.len() as u64;
                chunks.insert(index, data);
                done.set(index, true);
            }
        }
        if reused_bytes > 0 {
            debug!(
                "reusing {} cached chunks ({} bytes) for {}",
                chunks.len(),
                reused_bytes,
                blob.hash
            );
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_chunks.max(1)));
        let timeout = Duration::from_millis(self.config.chunk_timeout_ms);
        let mut tasks = JoinSet::new();

        for (index, (start, end)) in ranges.iter().copied().enumerate() {
            if done[index] {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let semaphore = Arc::clone(&semaphore);
            let stats = Arc::clone(&self.stats);
            let shutdown = self.shutdown_token.clone();
            let url = url.to_string();

            tasks.spawn(async move {
                let outcome = Self::fetch_chunk(
                    index, start, end, &url, transport, semaphore, stats, shutdown, timeout,
                )
                .await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("chunk task panicked or was cancelled: {}", e);
                    continue;
                }
            };
            match outcome {
                Ok(data) => {
                    self.chunk_cache
                        .put(ChunkKey::new(&blob.hash, index), data.clone());
                    chunks.insert(index, data);
                    done.set(index, true);
                }
                Err(e) => {
                    self.stats.record_chunk_failure();
                    chunk_errors.insert(index, e.to_string());
                }
            }
        }

        self.stats.record_request(blob.size_bytes, reused_bytes);

        let validation = validate_chunks(&chunks, total_chunks, blob.size_bytes, &chunk_errors);
        if !validation.is_valid {
            let message = format_validation_error(&validation);
            warn!(
                "chunked download of {} incomplete ({}/{} chunks): {}",
                blob.hash,
                done.count_ones(),
                total_chunks,
                message
            );
            return Err(BlobError::Validation(message));
        }

        let mut assembled = BytesMut::with_capacity(blob.size_bytes as usize);
        for chunk in chunks.values() {
            assembled.extend_from_slice(chunk);
        }
        info!(
            "chunked download of {} complete: {} chunks, {} bytes",
            blob.hash, total_chunks, blob.size_bytes
        );
        Ok(assembled.freeze())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_chunk(
        index: usize,
        start: u64,
        end: u64,
        url: &str,
        transport: Arc<dyn BlobTransport>,
        semaphore: Arc<Semaphore>,
        stats: Arc<StatsCollector>,
        shutdown: CancellationToken,
        timeout: Duration,
    ) -> Result<Bytes> {
        // Acquire a permit, but bail if shutdown fires while waiting.
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|e| BlobError::Unavailable(e.to_string()))?
            }
            _ = shutdown.cancelled() => {
                debug!("chunk {} cancelled while waiting for permit", index);
                return Err(BlobError::Unavailable("downloader shut down".to_string()));
            }
        };

        stats.increment_workers();
        let result = tokio::select! {
            fetched = tokio::time::timeout(timeout, transport.fetch_range(url, start, end)) => {
                match fetched {
                    Ok(Ok(data)) => Ok(data),
                    Ok(Err(e)) => Err(BlobError::Network(e.to_string())),
                    Err(_) => Err(BlobError::Timeout(timeout.as_millis() as u64)),
                }
            }
            _ = shutdown.cancelled() => {
                Err(BlobError::Unavailable("downloader shut down".to_string()))
            }
        };
        stats.decrement_workers();

        match result {
            Ok(data) => {
                let expected = end - start + 1;
                if data.len() as u64 != expected {
                    warn!(
                        "chunk {} short read: expected {} bytes, got {}",
                        index,
                        expected,
                        data.len()
                    );
                    return Err(BlobError::Validation(format!(
                        "chunk {} expected {} bytes, got {}",
                        index,
                        expected,
                        data.len()
                    )));
                }
                stats.record_downloaded(data.len() as u64);
                debug!("chunk {} downloaded ({} bytes)", index, data.len());
                Ok(data)
            }
            Err(e) => {
                warn!("chunk {} fetch failed: {}", index, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_map(sizes: &[(usize, usize)]) -> BTreeMap<usize, Bytes> {
        sizes
            .iter()
            .map(|&(i, n)| (i, Bytes::from(vec![0u8; n])))
            .collect()
    }

    #[test]
    fn test_plan_chunks_covers_blob() {
        assert_eq!(plan_chunks(10, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(plan_chunks(8, 4), vec![(0, 3), (4, 7)]);
        assert!(plan_chunks(0, 4).is_empty());
    }

    #[test]
    fn test_validate_complete_chunks() {
        let chunks = chunk_map(&[(0, 4), (1, 4), (2, 2)]);
        let v = validate_chunks(&chunks, 3, 10, &BTreeMap::new());
        assert!(v.is_valid);
        assert_eq!(v.successful_chunks, 3);
        assert_eq!(format_validation_error(&v), "All chunks validated successfully");
    }

    #[test]
    fn test_validate_reports_missing_failed_and_size() {
        let chunks = chunk_map(&[(0, 4), (2, 2)]);
        let mut errors = BTreeMap::new();
        errors.insert(1, "timed out after 30000ms".to_string());

        let v = validate_chunks(&chunks, 3, 10, &errors);
        assert!(!v.is_valid);
        assert_eq!(v.missing_chunk_indices, vec![1]);
        assert_eq!(v.failed_chunk_indices, vec![1]);
        assert_eq!(v.actual_size_bytes, 6);
        assert_eq!(
            format_validation_error(&v),
            "Missing chunks: [1]; Failed chunks: 1; Size mismatch: expected 10 bytes, got 6 bytes"
        );
    }

    #[test]
    fn test_size_mismatch_alone_is_invalid() {
        let chunks = chunk_map(&[(0, 4), (1, 4)]);
        let v = validate_chunks(&chunks, 2, 9, &BTreeMap::new());
        assert!(!v.is_valid);
        assert_eq!(
            format_validation_error(&v),
            "Size mismatch: expected 9 bytes, got 8 bytes"
        );
    }
}
