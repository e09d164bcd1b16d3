// Custodian registry, replica selection and blob commitment lifecycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::LivenessProbe;
use super::types::{
    BlobCommitment, CommitmentKey, CommitmentStatus, CustodianCapability, CustodianStats,
    HealthProbeResult, ReplicationHealth, ReplicationStatus, SelectionCriteria,
};
use crate::config::CustodianConfig;
use crate::error::{BlobError, Result};
use crate::model::ContentBlob;

const SECS_PER_DAY: u64 = 24 * 60 * 60;
/// Bitrate assumed when a blob does not declare one.
const DEFAULT_BITRATE_MBPS: f64 = 5.0;
/// Latency treated as "as bad as it gets" when the criteria set no cap.
const DEFAULT_LATENCY_CEILING_MS: u32 = 500;

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct ProbeCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    selections: AtomicU64,
}

pub struct CustodianManager {
    custodians: DashMap<String, CustodianCapability>,
    commitments: DashMap<CommitmentKey, BlobCommitment>,
    probe: Arc<dyn LivenessProbe>,
    config: CustodianConfig,
    counters: ProbeCounters,
}

impl CustodianManager {
    pub fn new(probe: Arc<dyn LivenessProbe>, config: CustodianConfig) -> Self {
        Self {
            custodians: DashMap::new(),
            commitments: DashMap::new(),
            probe,
            config,
            counters: ProbeCounters::default(),
        }
    }

    pub fn register_custodian(&self, capability: CustodianCapability) {
        info!(
            custodian = %capability.id,
            bandwidth = capability.bandwidth_mbps,
            region = ?capability.region,
            "registered custodian"
        );
        self.custodians.insert(capability.id.clone(), capability);
    }

    pub fn unregister_custodian(&self, custodian_id: &str) -> bool {
        self.custodians.remove(custodian_id).is_some()
    }

    pub fn custodian(&self, custodian_id: &str) -> Option<CustodianCapability> {
        self.custodians.get(custodian_id).map(|c| c.clone())
    }

    // ---- selection ----

    fn passes_hard_filters(
        &self,
        c: &CustodianCapability,
        blob: &ContentBlob,
        criteria: &SelectionCriteria,
    ) -> bool {
        if !criteria.reach.admits_custodian(c.reach) {
            return false;
        }
        let headroom = c.headroom_mbps();
        if criteria.min_bandwidth_mbps.is_some_and(|min| headroom < min) {
            return false;
        }
        // Streaming needs twice the bitrate to stay ahead of playback.
        if blob.bitrate_mbps.is_some_and(|b| headroom < b * 2.0) {
            return false;
        }
        if criteria.max_latency_ms.is_some_and(|max| c.latency_ms > max) {
            return false;
        }
        if criteria.min_uptime.is_some_and(|min| c.uptime < min) {
            return false;
        }
        blob.size_bytes <= c.max_blob_size_bytes
    }

    /// Fitness in `0..=105`: headroom 40, latency 30, uptime 20, region 10, health 5.
    pub fn score_custodian(
        &self,
        c: &CustodianCapability,
        blob: &ContentBlob,
        criteria: &SelectionCriteria,
    ) -> f64 {
        let needed = blob.bitrate_mbps.unwrap_or(DEFAULT_BITRATE_MBPS).max(0.001) * 2.0;
        let mut score = (c.headroom_mbps() / needed).min(1.0) * 40.0;

        let ceiling = criteria
            .max_latency_ms
            .unwrap_or(DEFAULT_LATENCY_CEILING_MS)
            .max(1) as f64;
        score += (1.0 - (c.latency_ms as f64 / ceiling).min(1.0)) * 30.0;

        score += c.uptime.clamp(0.0, 1.0) * 20.0;

        if criteria.preferred_regions.is_empty() {
            score += 5.0;
        } else if c
            .region
            .as_ref()
            .is_some_and(|r| criteria.preferred_regions.contains(r))
        {
            score += 10.0;
        }

        score + c.health_score() * 5.0
    }

    fn ranked_candidates(
        &self,
        blob: &ContentBlob,
        criteria: &SelectionCriteria,
        exclude: &HashSet<String>,
    ) -> Vec<CustodianCapability> {
        self.counters.selections.fetch_add(1, Ordering::Relaxed);
        let mut candidates: Vec<(CustodianCapability, f64)> = self
            .custodians
            .iter()
            .filter(|e| !exclude.contains(e.key()))
            .filter(|e| self.passes_hard_filters(e.value(), blob, criteria))
            .map(|e| {
                let c = e.value().clone();
                let score = self.score_custodian(&c, blob, criteria);
                (c, score)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        candidates.into_iter().map(|(c, _)| c).collect()
    }

    /// Best custodians for `blob`, highest fitness first.
    pub fn select_custodians_for_blob(
        &self,
        blob: &ContentBlob,
        content_id: &str,
        criteria: &SelectionCriteria,
    ) -> Vec<CustodianCapability> {
        let max = criteria
            .max_custodians
            .unwrap_or(self.config.default_max_custodians);
        let mut selected = self.ranked_candidates(blob, criteria, &HashSet::new());
        selected.truncate(max);
        debug!(
            content_id = %content_id,
            blob_hash = %blob.hash,
            count = selected.len(),
            "selected custodians"
        );
        selected
    }

    /// Custodians needed to reach `target_replicas`, skipping `existing` and
    /// anyone already holding a live commitment for this blob.
    pub fn select_additional_custodians(
        &self,
        blob: &ContentBlob,
        content_id: &str,
        existing: &[String],
        target_replicas: usize,
        criteria: &SelectionCriteria,
    ) -> Vec<CustodianCapability> {
        let shortfall = target_replicas.saturating_sub(existing.len());
        if shortfall == 0 {
            return Vec::new();
        }

        let mut exclude: HashSet<String> = existing.iter().cloned().collect();
        exclude.extend(
            self.commitments_for(content_id, &blob.hash)
                .into_iter()
                .filter(|c| !c.is_expired())
                .map(|c| c.custodian_id),
        );

        let mut selected = self.ranked_candidates(blob, criteria, &exclude);
        selected.truncate(shortfall);
        debug!(
            content_id = %content_id,
            blob_hash = %blob.hash,
            shortfall,
            found = selected.len(),
            "selected additional custodians"
        );
        selected
    }

    // ---- commitments ----

    /// Create a pending commitment. An existing live commitment is returned unchanged.
    pub fn create_blob_commitment(
        &self,
        content_id: &str,
        blob: &ContentBlob,
        custodian_id: &str,
        ttl_days: Option<u32>,
    ) -> Result<BlobCommitment> {
        let custodian = self
            .custodian(custodian_id)
            .ok_or_else(|| BlobError::Input(format!("unknown custodian {}", custodian_id)))?;

        let key = CommitmentKey::new(content_id, &blob.hash, custodian_id);
        let now = Instant::now();
        let ttl_days = ttl_days.unwrap_or(self.config.default_ttl_days);
        let ttl = Duration::from_secs(ttl_days as u64 * SECS_PER_DAY);
        let created_at_ms = wall_clock_ms();

        let fresh = || BlobCommitment {
            content_id: content_id.to_string(),
            blob_hash: blob.hash.clone(),
            custodian_id: custodian_id.to_string(),
            status: CommitmentStatus::Pending,
            replication_progress: 0,
            bandwidth_mbps: 0.0,
            fallback_url: custodian.blob_url(&blob.hash),
            created_at_ms,
            expires_at_ms: created_at_ms + ttl.as_millis() as u64,
            last_verified_at_ms: None,
            expires_at: now + ttl,
        };

        let mut entry = self.commitments.entry(key).or_insert_with(&fresh);
        entry.expire_if_due(now);
        if entry.is_expired() || entry.is_lapsed(now) {
            *entry = fresh();
        }

        info!(
            content_id = %content_id,
            blob_hash = %blob.hash,
            custodian = %custodian_id,
            ttl_days,
            "blob commitment {:?}",
            entry.status
        );
        Ok(entry.clone())
    }

    fn unknown(key: &CommitmentKey) -> BlobError {
        BlobError::UnknownCommitment {
            content_id: key.content_id.clone(),
            blob_hash: key.blob_hash.clone(),
            custodian_id: key.custodian_id.clone(),
        }
    }

    /// Record replication progress. Progress never decreases; reaching 100 activates.
    pub fn update_replication_progress(
        &self,
        key: &CommitmentKey,
        progress_percent: u8,
        bandwidth_mbps: f64,
    ) -> Result<BlobCommitment> {
        let now = Instant::now();
        if self.drop_if_lapsed(key, now) {
            return Err(BlobError::InvalidTransition(format!(
                "pending commitment for {} on {} lapsed before replication finished",
                key.blob_hash, key.custodian_id
            )));
        }
        let mut commitment = self
            .commitments
            .get_mut(key)
            .ok_or_else(|| Self::unknown(key))?;

        commitment.expire_if_due(now);
        if commitment.is_expired() {
            return Err(BlobError::InvalidTransition(format!(
                "commitment for {} on {} has expired",
                key.blob_hash, key.custodian_id
            )));
        }

        commitment.replication_progress = commitment
            .replication_progress
            .max(progress_percent.min(100));
        commitment.bandwidth_mbps = bandwidth_mbps;
        commitment.last_verified_at_ms = Some(wall_clock_ms());

        if commitment.replication_progress == 100 && commitment.status == CommitmentStatus::Pending
        {
            commitment.status = CommitmentStatus::Active;
            info!(
                blob_hash = %key.blob_hash,
                custodian = %key.custodian_id,
                "commitment active"
            );
        }
        Ok(commitment.clone())
    }

    /// Expire an `Active` commitment. Revoking an expired one is a no-op; a
    /// `Pending` one has to be withdrawn instead.
    pub fn revoke_commitment(
        &self,
        content_id: &str,
        blob_hash: &str,
        custodian_id: &str,
    ) -> Result<BlobCommitment> {
        let key = CommitmentKey::new(content_id, blob_hash, custodian_id);
        let mut commitment = self
            .commitments
            .get_mut(&key)
            .ok_or_else(|| Self::unknown(&key))?;
        match commitment.status {
            CommitmentStatus::Pending => {
                return Err(BlobError::InvalidTransition(format!(
                    "commitment for {} on {} is still pending",
                    blob_hash, custodian_id
                )));
            }
            CommitmentStatus::Active => {
                commitment.status = CommitmentStatus::Expired;
                info!(blob_hash = %blob_hash, custodian = %custodian_id, "commitment revoked");
            }
            CommitmentStatus::Expired => {}
        }
        Ok(commitment.clone())
    }

    /// Drop a commitment that never became active.
    pub fn withdraw_commitment(
        &self,
        content_id: &str,
        blob_hash: &str,
        custodian_id: &str,
    ) -> Result<BlobCommitment> {
        let key = CommitmentKey::new(content_id, blob_hash, custodian_id);
        let removed = self
            .commitments
            .remove_if(&key, |_, c| c.status == CommitmentStatus::Pending);
        match removed {
            Some((_, commitment)) => {
                info!(blob_hash = %blob_hash, custodian = %custodian_id, "commitment withdrawn");
                Ok(commitment)
            }
            None if self.commitments.contains_key(&key) => Err(BlobError::InvalidTransition(
                format!("commitment for {} on {} is no longer pending", blob_hash, custodian_id),
            )),
            None => Err(Self::unknown(&key)),
        }
    }

    fn drop_if_lapsed(&self, key: &CommitmentKey, now: Instant) -> bool {
        let dropped = self.commitments.remove_if(key, |_, c| c.is_lapsed(now)).is_some();
        if dropped {
            debug!(
                blob_hash = %key.blob_hash,
                custodian = %key.custodian_id,
                "pending commitment lapsed"
            );
        }
        dropped
    }

    /// Remove every `Pending` commitment past its TTL.
    fn drop_lapsed(&self, now: Instant) -> usize {
        let before = self.commitments.len();
        self.commitments.retain(|_, c| !c.is_lapsed(now));
        before - self.commitments.len()
    }

    /// Every commitment for one blob of one content item, with TTLs applied.
    pub fn commitments_for(&self, content_id: &str, blob_hash: &str) -> Vec<BlobCommitment> {
        let now = Instant::now();
        self.drop_lapsed(now);
        self.commitments
            .iter_mut()
            .filter(|e| e.key().content_id == content_id && e.key().blob_hash == blob_hash)
            .map(|mut e| {
                e.expire_if_due(now);
                e.clone()
            })
            .collect()
    }

    pub fn get_blob_replication_status(
        &self,
        content_id: &str,
        blob_hash: &str,
    ) -> ReplicationStatus {
        let live: Vec<BlobCommitment> = self
            .commitments_for(content_id, blob_hash)
            .into_iter()
            .filter(|c| !c.is_expired())
            .collect();
        let active = live.iter().filter(|c| c.is_active()).count();
        let custodian_count = live.len();

        ReplicationStatus {
            content_id: content_id.to_string(),
            blob_hash: blob_hash.to_string(),
            custodian_count,
            active_replicas: active,
            pending_replicas: custodian_count - active,
            health: ReplicationHealth::classify(active, custodian_count),
        }
    }

    /// Active commitment URLs, highest bandwidth first.
    pub fn get_fallback_urls(&self, content_id: &str, blob_hash: &str) -> Vec<String> {
        let mut active: Vec<BlobCommitment> = self
            .commitments_for(content_id, blob_hash)
            .into_iter()
            .filter(BlobCommitment::is_active)
            .collect();
        active.sort_by(|a, b| b.bandwidth_mbps.total_cmp(&a.bandwidth_mbps));
        active.into_iter().map(|c| c.fallback_url).collect()
    }

    pub fn get_best_custodian_url(&self, content_id: &str, blob_hash: &str) -> Option<String> {
        self.get_fallback_urls(content_id, blob_hash).into_iter().next()
    }

    /// Expire active commitments past their TTL and drop pending ones that
    /// lapsed. Returns how many commitments were affected.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let dropped = self.drop_lapsed(now);
        let expired = self
            .commitments
            .iter_mut()
            .filter_map(|mut e| e.expire_if_due(now).then_some(()))
            .count();
        if expired + dropped > 0 {
            info!(expired, dropped, "commitment TTL sweep");
        }
        expired + dropped
    }

    // ---- health ----

    /// Probe one custodian and fold the result into its capability record.
    /// `None` when the custodian is not registered.
    pub async fn probe_custodian_health(&self, custodian_id: &str) -> Option<HealthProbeResult> {
        let (base_url, bandwidth_mbps) = {
            let c = self.custodians.get(custodian_id)?;
            (c.base_url.clone(), c.bandwidth_mbps)
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let t0 = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.probe.check(&base_url)).await;
        let latency_ms = t0.elapsed().as_millis() as u32;

        let result = match outcome {
            Ok(Ok(health)) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                if let Some(mut c) = self.custodians.get_mut(custodian_id) {
                    c.health_check_successes += 1;
                    c.latency_ms = latency_ms;
                    c.last_health_check = Some(Instant::now());
                }
                HealthProbeResult {
                    online: true,
                    accepting_blobs: health.accepting_blobs,
                    bandwidth_mbps,
                    latency_ms,
                }
            }
            Ok(Err(e)) => {
                debug!("health probe of {} failed: {}", custodian_id, e);
                self.record_probe_failure(custodian_id);
                HealthProbeResult {
                    online: false,
                    accepting_blobs: false,
                    bandwidth_mbps: 0.0,
                    latency_ms,
                }
            }
            Err(_) => {
                debug!("health probe of {} timed out", custodian_id);
                self.record_probe_failure(custodian_id);
                HealthProbeResult {
                    online: false,
                    accepting_blobs: false,
                    bandwidth_mbps: 0.0,
                    latency_ms: 0,
                }
            }
        };
        Some(result)
    }

    fn record_probe_failure(&self, custodian_id: &str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(mut c) = self.custodians.get_mut(custodian_id) {
            c.health_check_failures += 1;
            c.last_health_check = Some(Instant::now());
        }
    }

    /// Probe every registered custodian. Returns `(online, offline)`.
    pub async fn probe_all_custodians(&self) -> (usize, usize) {
        let ids: Vec<String> = self.custodians.iter().map(|e| e.key().clone()).collect();
        let results =
            futures::future::join_all(ids.iter().map(|id| self.probe_custodian_health(id))).await;

        let online = results.iter().flatten().filter(|r| r.online).count();
        let offline = ids.len() - online;
        info!(online, offline, "custodian health probe cycle");
        (online, offline)
    }

    /// Periodic TTL sweep and health probing until `shutdown` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_expired();
                        manager.probe_all_custodians().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("custodian maintenance stopped");
                        return;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> CustodianStats {
        let now = Instant::now();
        self.drop_lapsed(now);
        let (mut active, mut pending, mut expired) = (0, 0, 0);
        for mut e in self.commitments.iter_mut() {
            e.expire_if_due(now);
            match e.status {
                CommitmentStatus::Active => active += 1,
                CommitmentStatus::Pending => pending += 1,
                CommitmentStatus::Expired => expired += 1,
            }
        }
        CustodianStats {
            registered_custodians: self.custodians.len(),
            total_commitments: active + pending + expired,
            active_commitments: active,
            pending_commitments: pending,
            expired_commitments: expired,
            total_probes: self.counters.total.load(Ordering::Relaxed),
            successful_probes: self.counters.successful.load(Ordering::Relaxed),
            failed_probes: self.counters.failed.load(Ordering::Relaxed),
            total_selections: self.counters.selections.load(Ordering::Relaxed),
        }
    }

    /// Drop every custodian and commitment.
    pub fn clear(&self) {
        if !self.commitments.is_empty() {
            warn!("clearing {} commitments", self.commitments.len());
        }
        self.custodians.clear();
        self.commitments.clear();
    }
}
