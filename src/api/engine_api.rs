// Engine facade: wires the fetch, custodian, integrity and cache layers together
// and drives the end-to-end retrieval flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
    BlobCache, CacheStats, CacheStore, ChunkCache, PrioritySignals, ReachAwareCache, SledStore,
};
use crate::config::EngineConfig;
use crate::custodian::{
    BlobCommitment, CommitmentKey, CustodianCapability, CustodianManager, HttpLivenessProbe,
    LivenessProbe, ReplicationStatus, SelectionCriteria,
};
use crate::engine::bandwidth::{
    recommend_quality, BandwidthProbe, BandwidthProber, QualityRecommendation,
};
use crate::engine::bootstrap::{wait_for_source, Bootstrap, BootstrapState};
use crate::engine::downloader::ChunkedDownloader;
use crate::engine::stats::{StatsCollector, StatsSnapshot};
use crate::error::{BlobError, Result};
use crate::fetch::{FallbackFetcher, FetchOutcome};
use crate::integrity::{is_valid_hash, IntegrityVerifier, VerificationResult};
use crate::model::{ContentBlob, ReachLevel};
use crate::source::{BlobTransport, HttpTransport};

/// Source of `ContentBlob` records, keyed by content id.
#[async_trait]
pub trait ContentMetadataProvider: Send + Sync {
    /// `Ok(None)` when the content id is unknown.
    async fn content_blob(&self, content_id: &str) -> anyhow::Result<Option<ContentBlob>>;
}

/// Where a retrieved blob lands in the reach-aware cache, and which content
/// item it belongs to (used to look up custodian replicas).
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub content_id: Option<String>,
    pub reach: ReachLevel,
    pub domain: String,
    pub epic: String,
    pub signals: PrioritySignals,
}

impl Placement {
    pub fn new(reach: ReachLevel) -> Self {
        Self {
            reach,
            ..Default::default()
        }
    }

    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn with_domain_epic(mut self, domain: impl Into<String>, epic: impl Into<String>) -> Self {
        self.domain = domain.into();
        self.epic = epic.into();
        self
    }

    pub fn with_signals(mut self, signals: PrioritySignals) -> Self {
        self.signals = signals;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "url")]
pub enum BlobOrigin {
    /// In-memory blob cache.
    Memory,
    /// Durable store, re-verified on load.
    Store,
    /// Downloaded from the given URL.
    Network(String),
}

/// Verified blob bytes and where they came from.
#[derive(Debug, Clone)]
pub struct RetrievedBlob {
    pub hash: String,
    pub data: Bytes,
    pub origin: BlobOrigin,
}

pub struct BlobEngine {
    config: EngineConfig,
    stats: Arc<StatsCollector>,
    fetcher: FallbackFetcher,
    prober: BandwidthProber,
    downloader: ChunkedDownloader,
    verifier: IntegrityVerifier,
    probe: Arc<dyn LivenessProbe>,
    custodians: Arc<CustodianManager>,
    cache: ReachAwareCache,
    blobs: BlobCache,
    chunks: Arc<ChunkCache>,
    store: Option<Arc<dyn CacheStore>>,
    store_error: Option<String>,
    bootstrap: Bootstrap,
    metadata: Option<Arc<dyn ContentMetadataProvider>>,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlobEngine {
    /// Engine backed by reqwest for blob transfer and custodian health checks.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let transport = HttpTransport::with_timeout(config.fetch.timeout())
            .map_err(|e| BlobError::Config(format!("http client: {}", e)))?;
        let probe = HttpLivenessProbe::new(Duration::from_millis(config.custodian.probe_timeout_ms))
            .map_err(|e| BlobError::Config(format!("health client: {}", e)))?;
        Ok(Self::with_parts(config, Arc::new(transport), Arc::new(probe)))
    }

    /// Engine over caller-supplied transport and liveness probe.
    ///
    /// Opens the durable store when `cache.store_path` is set. A store that fails
    /// to open leaves the engine memory-only; `start` then ends in `Degraded`.
    pub fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn BlobTransport>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let chunks = Arc::new(ChunkCache::new(
            config.cache.chunk_cache_max_entries,
            Duration::from_secs(config.cache.chunk_ttl_secs),
        ));

        let (store, store_error) = match &config.cache.store_path {
            Some(path) => match SledStore::open(path) {
                Ok(s) => (Some(Arc::new(s) as Arc<dyn CacheStore>), None),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        "cache store unavailable, running memory-only: {}",
                        e
                    );
                    (None, Some(e.to_string()))
                }
            },
            None => (None, None),
        };

        let mut cache = ReachAwareCache::new(&config.cache);
        if let Some(store) = &store {
            cache = cache.with_store(Arc::clone(store));
        }

        Self {
            fetcher: FallbackFetcher::new(
                Arc::clone(&transport),
                config.fetch.clone(),
                Arc::clone(&stats),
            ),
            prober: BandwidthProber::new(Arc::clone(&transport), config.probe.clone()),
            downloader: ChunkedDownloader::new(
                Arc::clone(&transport),
                Arc::clone(&chunks),
                Arc::clone(&stats),
                config.chunking.clone(),
            ),
            verifier: IntegrityVerifier::detect(),
            custodians: Arc::new(CustodianManager::new(
                Arc::clone(&probe),
                config.custodian.clone(),
            )),
            probe,
            cache,
            blobs: BlobCache::new(
                config.cache.blob_cache_max_bytes,
                Duration::from_secs(config.cache.blob_ttl_secs),
            ),
            chunks,
            store,
            store_error,
            bootstrap: Bootstrap::new(),
            metadata: None,
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stats,
            config,
        }
    }

    pub fn with_metadata_provider(mut self, provider: Arc<dyn ContentMetadataProvider>) -> Self {
        self.metadata = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    pub fn custodians(&self) -> &Arc<CustodianManager> {
        &self.custodians
    }

    pub fn fetcher(&self) -> &FallbackFetcher {
        &self.fetcher
    }

    pub fn reach_cache(&self) -> &ReachAwareCache {
        &self.cache
    }

    pub fn blob_cache(&self) -> &BlobCache {
        &self.blobs
    }

    pub fn chunk_cache(&self) -> &Arc<ChunkCache> {
        &self.chunks
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether verified blobs are persisted across restarts.
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Whether this engine can take in new blobs (used by the custodian endpoint).
    pub fn accepting_blobs(&self) -> bool {
        !self.shutdown_token.is_cancelled()
            && matches!(
                self.bootstrap.state(),
                BootstrapState::Ready | BootstrapState::Degraded
            )
    }

    // ---- lifecycle ----

    /// Drive the bootstrap state machine to `Ready` or `Degraded` and start the
    /// background maintenance tasks. Calling it again after start is a no-op.
    pub async fn start(&self) -> BootstrapState {
        if self.bootstrap.state() != BootstrapState::Initializing {
            return self.bootstrap.state();
        }
        if let Err(e) = self.bootstrap.transition(BootstrapState::WaitingSource) {
            warn!("{}", e);
            return self.bootstrap.state();
        }

        let mut source_missing = false;
        if !self.config.bootstrap.source_urls.is_empty() {
            match wait_for_source(self.probe.as_ref(), &self.config.bootstrap).await {
                Some(url) => info!("content source live url={}", url),
                None => source_missing = true,
            }
        }

        // Persisted entries are restored whether or not a source answered.
        if let Err(e) = self.bootstrap.transition(BootstrapState::LoadingMetadata) {
            warn!("{}", e);
            return self.bootstrap.state();
        }
        let restore_error = self.cache.restore_from_store().err();
        self.spawn_background();

        if source_missing {
            self.bootstrap
                .degrade("no content source answered its health check");
        } else if let Some(reason) = &self.store_error {
            self.bootstrap
                .degrade(format!("cache store unavailable: {}", reason));
        } else if let Some(e) = restore_error {
            self.bootstrap
                .degrade(format!("cache restore failed: {}", e));
        } else if let Err(e) = self.bootstrap.transition(BootstrapState::Ready) {
            warn!("{}", e);
        }
        self.bootstrap.state()
    }

    fn spawn_background(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.chunks.spawn_cleanup(Duration::from_secs(
            self.config.cache.chunk_cleanup_interval_secs.max(1),
        )));
        tasks.push(self.custodians.spawn_maintenance(
            self.config.custodian.maintenance_interval(),
            self.shutdown_token.child_token(),
        ));
    }

    /// Stop background work and in-flight downloads, flush the store and drop
    /// in-memory caches. Persisted entries survive for the next start.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.downloader.shutdown();
        self.chunks.dispose();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.blobs.dispose();
        self.cache.dispose();
        info!("blob engine shut down");
    }

    // ---- retrieval ----

    /// Return verified bytes for `blob`, from cache when possible, otherwise
    /// from custodian replicas and then the blob's own fallback URLs.
    pub async fn retrieve(
        &self,
        blob: &ContentBlob,
        placement: &Placement,
    ) -> Result<RetrievedBlob> {
        if !is_valid_hash(&blob.hash) {
            return Err(BlobError::Input(format!(
                "blob hash {:?} is not a SHA-256 hex digest",
                blob.hash
            )));
        }
        let hash = blob.hash.to_ascii_lowercase();

        if let Some(data) = self.blobs.get(&hash) {
            debug!("blob cache hit hash={}", hash);
            self.cache.touch(&hash);
            self.stats.record_request(data.len() as u64, data.len() as u64);
            return Ok(RetrievedBlob {
                hash,
                data,
                origin: BlobOrigin::Memory,
            });
        }

        if let Some(data) = self.load_persisted(&hash).await {
            self.stats.record_request(data.len() as u64, data.len() as u64);
            self.admit(blob, &hash, placement, &data, None);
            return Ok(RetrievedBlob {
                hash,
                data,
                origin: BlobOrigin::Store,
            });
        }

        let urls = self.candidate_urls(blob, placement.content_id.as_deref());
        if urls.is_empty() {
            return Err(BlobError::Input(format!("no source URLs for blob {}", hash)));
        }

        let (data, url) = self.download_verified(blob, &hash, &urls).await?;

        self.admit(blob, &hash, placement, &data, Some(&url));
        info!(hash = %hash, url = %url, size = data.len(), "blob retrieved");
        Ok(RetrievedBlob {
            hash,
            data,
            origin: BlobOrigin::Network(url),
        })
    }

    /// Look `content_id` up through the metadata provider, pick the variant the
    /// measured bandwidth supports, and retrieve it.
    pub async fn retrieve_content(
        &self,
        content_id: &str,
        placement: &Placement,
    ) -> Result<RetrievedBlob> {
        let provider = self.metadata.as_ref().ok_or_else(|| {
            BlobError::Unavailable("no content metadata provider configured".to_string())
        })?;
        let blob = provider
            .content_blob(content_id)
            .await
            .map_err(|e| {
                BlobError::Unavailable(format!("metadata lookup for {}: {}", content_id, e))
            })?
            .ok_or_else(|| BlobError::Input(format!("unknown content {}", content_id)))?;

        let blob = self.resolve_variant(&blob).await;
        let placement = placement.clone().with_content_id(content_id);
        self.retrieve(&blob, &placement).await
    }

    /// The blob describing the variant to fetch. Falls back to `blob` itself when
    /// it has no variants, bandwidth cannot be measured, or the chosen variant
    /// lacks its own hash and URLs.
    async fn resolve_variant(&self, blob: &ContentBlob) -> ContentBlob {
        let Some(probe_url) = blob.fallback_urls.first() else {
            return blob.clone();
        };
        if blob.variants.is_empty() {
            return blob.clone();
        }
        let bandwidth = match self.prober.probe_bandwidth(probe_url, None).await {
            Ok(p) => p.average_speed_mbps,
            Err(e) => {
                debug!("variant selection skipped for {}: {}", blob.hash, e);
                return blob.clone();
            }
        };

        let pick = recommend_quality(blob, bandwidth);
        let Some(variant) = blob.variants.iter().find(|v| v.label == pick.variant) else {
            return blob.clone();
        };
        match (&variant.hash, variant.size_bytes) {
            (Some(hash), Some(size)) if !variant.fallback_urls.is_empty() => {
                debug!(
                    "variant {} ({} Mbps) chosen for {} at {:.1} Mbps",
                    variant.label, variant.bitrate_mbps, blob.hash, bandwidth
                );
                ContentBlob {
                    hash: hash.clone(),
                    size_bytes: size,
                    mime_type: blob.mime_type.clone(),
                    fallback_urls: variant.fallback_urls.clone(),
                    bitrate_mbps: Some(variant.bitrate_mbps),
                    duration_secs: blob.duration_secs,
                    codec: blob.codec.clone(),
                    variants: Vec::new(),
                }
            }
            _ => blob.clone(),
        }
    }

    /// Active custodian replicas (best bandwidth first) ahead of the blob's own
    /// fallback URLs, deduplicated, then healthy URLs first.
    fn candidate_urls(&self, blob: &ContentBlob, content_id: Option<&str>) -> Vec<String> {
        let mut urls = content_id
            .map(|id| self.custodians.get_fallback_urls(id, &blob.hash))
            .unwrap_or_default();
        for url in &blob.fallback_urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        self.fetcher.healthy_first(&urls)
    }

    /// Bytes for `blob` from the first candidate whose download hashes to `hash`.
    /// Large blobs go through the chunked downloader on sources that honour
    /// ranges; everything else, and any ranged source that fails, goes through
    /// the fallback fetcher. A source whose bytes fail verification is marked
    /// unhealthy and the next candidate is tried.
    async fn download_verified(
        &self,
        blob: &ContentBlob,
        hash: &str,
        urls: &[String],
    ) -> Result<(Bytes, String)> {
        let mut mismatched: Vec<String> = Vec::new();
        let mut last_mismatch: Option<BlobError> = None;

        if blob.size_bytes >= self.config.chunking.min_chunked_size_bytes {
            for url in urls {
                if !self.downloader.check_range_support(url).await {
                    continue;
                }
                let started = Instant::now();
                let data = match self.downloader.download_ranged(blob, url).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("chunked download failed url={}: {}", url, e);
                        self.fetcher.health().record_failure(url, e.to_string());
                        continue;
                    }
                };
                match self.check_digest(hash, url, data).await {
                    Ok(data) => {
                        self.fetcher.health().record_success(url);
                        self.stats
                            .record_transfer(url, data.len() as u64, started.elapsed());
                        return Ok((data, url.clone()));
                    }
                    Err(e) => {
                        // Cached chunks are keyed by hash only; drop them so the
                        // next source starts clean.
                        let purged = self.chunks.delete_blob(hash);
                        debug!("dropped {} chunks of {} after mismatch", purged, hash);
                        mismatched.push(url.clone());
                        last_mismatch = Some(e);
                    }
                }
            }
            debug!("no ranged source completed {}, fetching whole", blob.hash);
        }

        let mut remaining: Vec<String> = urls
            .iter()
            .filter(|u| !mismatched.contains(u))
            .cloned()
            .collect();
        while !remaining.is_empty() {
            let outcome = match self.fetcher.fetch_with_fallback(&remaining, None, None).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(last_mismatch.unwrap_or(e)),
            };
            self.stats.record_request(outcome.data.len() as u64, 0);
            match self.check_digest(hash, &outcome.success_url, outcome.data).await {
                Ok(data) => {
                    let elapsed = Duration::from_millis(outcome.duration_ms);
                    self.stats
                        .record_transfer(&outcome.success_url, data.len() as u64, elapsed);
                    return Ok((data, outcome.success_url));
                }
                Err(e) => {
                    last_mismatch = Some(e);
                    remaining.drain(..=outcome.url_index);
                }
            }
        }
        Err(last_mismatch
            .unwrap_or_else(|| BlobError::Exhausted(format!("no source served blob {}", hash))))
    }

    /// `data` when it hashes to `hash`; otherwise a validation error, with the
    /// mismatch recorded against `url`.
    async fn check_digest(&self, hash: &str, url: &str, data: Bytes) -> Result<Bytes> {
        let verification = self.verifier.verify_blob(data.clone(), hash).await;
        if verification.is_valid {
            return Ok(data);
        }
        warn!(hash = %hash, url = %url, "hash mismatch");
        self.fetcher.health().record_failure(url, "hash mismatch");
        Err(BlobError::Validation(format!(
            "blob {} from {}: {}",
            hash,
            url,
            verification
                .error
                .unwrap_or_else(|| format!("computed {}", verification.computed_hash))
        )))
    }

    async fn load_persisted(&self, hash: &str) -> Option<Bytes> {
        let store = self.store.as_ref()?;
        let data = match store.load_blob(hash) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                warn!("cache store read failed hash={}: {}", hash, e);
                return None;
            }
        };
        let verification = self.verifier.verify_blob(data.clone(), hash).await;
        if verification.is_valid {
            debug!("blob restored from store hash={}", hash);
            return Some(data);
        }
        warn!("persisted blob {} failed verification, discarding", hash);
        if let Err(e) = store.remove_blob(hash) {
            warn!("cache store remove failed hash={}: {}", hash, e);
        }
        None
    }

    /// Record verified bytes in the byte cache and the reach-aware cache. Bytes
    /// fresh from `source` are also persisted, and when the caller gave no
    /// bandwidth class the source's measured throughput supplies one.
    fn admit(
        &self,
        blob: &ContentBlob,
        hash: &str,
        placement: &Placement,
        data: &Bytes,
        source: Option<&str>,
    ) {
        if let Err(e) = self.blobs.put(hash, data.clone()) {
            debug!("blob cache skipped {}: {}", hash, e);
        }
        let mut signals = placement.signals.clone();
        if signals.bandwidth_class.is_none() {
            signals.bandwidth_class = source.and_then(|url| self.stats.source_class(url));
        }
        let admitted = match self.cache.put(
            hash,
            blob.size_bytes.max(data.len() as u64),
            placement.reach,
            &placement.domain,
            &placement.epic,
            signals,
        ) {
            Ok(evicted) => {
                for victim in evicted {
                    self.blobs.delete(&victim);
                }
                true
            }
            Err(e) => {
                warn!("reach cache rejected {}: {}", hash, e);
                false
            }
        };
        if source.is_some() && admitted {
            if let Some(store) = &self.store {
                if let Err(e) = store.save_blob(hash, data) {
                    warn!("cache store write failed hash={}: {}", hash, e);
                }
            }
        }
    }

    /// Verified bytes for `hash` from memory or the durable store, without
    /// touching the network. Used by the custodian endpoint.
    pub async fn cached_bytes(&self, hash: &str) -> Option<Bytes> {
        let hash = hash.to_ascii_lowercase();
        if let Some(data) = self.blobs.get(&hash) {
            return Some(data);
        }
        let data = self.load_persisted(&hash).await?;
        if let Err(e) = self.blobs.put(&hash, data.clone()) {
            debug!("blob cache skipped {}: {}", hash, e);
        }
        Some(data)
    }

    pub fn record_served(&self, bytes: u64) {
        self.stats.record_served(bytes);
    }

    // ---- fetch / probe / quality ----

    pub async fn fetch_with_fallback(
        &self,
        urls: &[String],
        timeout: Option<Duration>,
        max_retries: Option<u32>,
    ) -> Result<FetchOutcome> {
        self.fetcher.fetch_with_fallback(urls, timeout, max_retries).await
    }

    pub async fn probe_bandwidth(
        &self,
        url: &str,
        sample_size_bytes: Option<u64>,
    ) -> Result<BandwidthProbe> {
        self.prober.probe_bandwidth(url, sample_size_bytes).await
    }

    pub fn recommend_quality(
        &self,
        blob: &ContentBlob,
        bandwidth_mbps: f64,
    ) -> QualityRecommendation {
        recommend_quality(blob, bandwidth_mbps)
    }

    // ---- integrity ----

    pub async fn verify_blob(&self, data: Bytes, expected_hash: &str) -> VerificationResult {
        self.verifier.verify_blob(data, expected_hash).await
    }

    pub async fn verify_chunk(&self, chunk: Bytes, expected_hash: &str) -> VerificationResult {
        self.verifier.verify_chunk(chunk, expected_hash).await
    }

    pub async fn verify_multiple(&self, pairs: Vec<(Bytes, String)>) -> Vec<VerificationResult> {
        self.verifier.verify_multiple(pairs).await
    }

    // ---- custodians ----

    pub fn register_custodian(&self, capability: CustodianCapability) {
        self.custodians.register_custodian(capability);
    }

    pub fn select_custodians_for_blob(
        &self,
        blob: &ContentBlob,
        content_id: &str,
        criteria: &SelectionCriteria,
    ) -> Vec<CustodianCapability> {
        self.custodians.select_custodians_for_blob(blob, content_id, criteria)
    }

    pub fn create_blob_commitment(
        &self,
        content_id: &str,
        blob: &ContentBlob,
        custodian_id: &str,
        ttl_days: Option<u32>,
    ) -> Result<BlobCommitment> {
        self.custodians
            .create_blob_commitment(content_id, blob, custodian_id, ttl_days)
    }

    pub fn update_replication_progress(
        &self,
        key: &CommitmentKey,
        progress_percent: u8,
        bandwidth_mbps: f64,
    ) -> Result<BlobCommitment> {
        self.custodians
            .update_replication_progress(key, progress_percent, bandwidth_mbps)
    }

    pub fn revoke_commitment(
        &self,
        content_id: &str,
        blob_hash: &str,
        custodian_id: &str,
    ) -> Result<BlobCommitment> {
        self.custodians
            .revoke_commitment(content_id, blob_hash, custodian_id)
    }

    pub fn withdraw_commitment(
        &self,
        content_id: &str,
        blob_hash: &str,
        custodian_id: &str,
    ) -> Result<BlobCommitment> {
        self.custodians
            .withdraw_commitment(content_id, blob_hash, custodian_id)
    }

    pub fn get_blob_replication_status(
        &self,
        content_id: &str,
        blob_hash: &str,
    ) -> ReplicationStatus {
        self.custodians.get_blob_replication_status(content_id, blob_hash)
    }

    // ---- reach-aware cache ----

    pub fn cache_put(
        &self,
        hash: &str,
        size_bytes: u64,
        placement: &Placement,
    ) -> Result<Vec<String>> {
        self.cache.put(
            hash,
            size_bytes,
            placement.reach,
            &placement.domain,
            &placement.epic,
            placement.signals.clone(),
        )
    }

    pub fn cache_has(&self, hash: &str) -> bool {
        self.cache.has(hash)
    }

    pub fn cache_touch(&self, hash: &str) -> bool {
        self.cache.touch(hash)
    }

    /// Drop `hash` from every cache layer and the store.
    pub fn cache_delete(&self, hash: &str) -> bool {
        let in_blobs = self.blobs.delete(hash);
        self.chunks.delete_blob(hash);
        let in_reach = self.cache.delete(hash);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_blob(hash) {
                warn!("cache store remove failed hash={}: {}", hash, e);
            }
        }
        in_blobs || in_reach
    }

    /// Stats of one reach partition, or all partitions merged when `reach` is `None`.
    pub fn cache_stats(&self, reach: Option<ReachLevel>) -> CacheStats {
        match reach {
            Some(r) => self.cache.stats(r),
            None => self.cache.global_stats(),
        }
    }
}
