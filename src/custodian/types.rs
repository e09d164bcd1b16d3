// Custodian capabilities, selection criteria, commitments and replication status.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::ReachLevel;

/// What a custodian node advertises about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodianCapability {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Total bandwidth the custodian offers, in Mbps.
    pub bandwidth_mbps: f64,
    pub latency_ms: u32,
    /// Historical availability, 0.0 ..= 1.0.
    pub uptime: f64,
    #[serde(default)]
    pub region: Option<String>,
    pub max_blob_size_bytes: u64,
    /// Fraction of capacity already in use, 0.0 ..= 1.0.
    #[serde(default)]
    pub current_load: f64,
    pub reach: ReachLevel,
    pub base_url: String,
    #[serde(default)]
    pub health_check_successes: u32,
    #[serde(default)]
    pub health_check_failures: u32,
    #[serde(skip)]
    pub last_health_check: Option<Instant>,
}

impl CustodianCapability {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            bandwidth_mbps: 0.0,
            latency_ms: 0,
            uptime: 1.0,
            region: None,
            max_blob_size_bytes: u64::MAX,
            current_load: 0.0,
            reach: ReachLevel::Commons,
            base_url: base_url.into(),
            health_check_successes: 0,
            health_check_failures: 0,
            last_health_check: None,
        }
    }

    pub fn with_bandwidth(mut self, mbps: f64) -> Self {
        self.bandwidth_mbps = mbps;
        self
    }

    pub fn with_latency(mut self, ms: u32) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn with_uptime(mut self, uptime: f64) -> Self {
        self.uptime = uptime;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_reach(mut self, reach: ReachLevel) -> Self {
        self.reach = reach;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load;
        self
    }

    pub fn with_max_blob_size(mut self, bytes: u64) -> Self {
        self.max_blob_size_bytes = bytes;
        self
    }

    /// Bandwidth not yet consumed by current load.
    pub fn headroom_mbps(&self) -> f64 {
        self.bandwidth_mbps * (1.0 - self.current_load.clamp(0.0, 1.0))
    }

    /// Share of successful health checks; 0.5 when never probed.
    pub fn health_score(&self) -> f64 {
        let total = self.health_check_successes + self.health_check_failures;
        if total == 0 {
            return 0.5;
        }
        self.health_check_successes as f64 / total as f64
    }

    pub fn blob_url(&self, blob_hash: &str) -> String {
        format!("{}/store/{}", self.base_url.trim_end_matches('/'), blob_hash)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    /// Reach of the content; custodians cleared for a more public tier are excluded.
    pub reach: ReachLevel,
    pub min_bandwidth_mbps: Option<f64>,
    pub max_latency_ms: Option<u32>,
    pub min_uptime: Option<f64>,
    pub max_custodians: Option<usize>,
    pub preferred_regions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentStatus {
    Pending,
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitmentKey {
    pub content_id: String,
    pub blob_hash: String,
    pub custodian_id: String,
}

impl CommitmentKey {
    pub fn new(
        content_id: impl Into<String>,
        blob_hash: impl Into<String>,
        custodian_id: impl Into<String>,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            blob_hash: blob_hash.into(),
            custodian_id: custodian_id.into(),
        }
    }
}

/// A custodian's promise to hold and serve one blob of one content item.
#[derive(Debug, Clone, Serialize)]
pub struct BlobCommitment {
    pub content_id: String,
    pub blob_hash: String,
    pub custodian_id: String,
    pub status: CommitmentStatus,
    /// 0 ..= 100, never decreases.
    pub replication_progress: u8,
    pub bandwidth_mbps: f64,
    /// `{custodian base url}/store/{blob_hash}`.
    pub fallback_url: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_verified_at_ms: Option<u64>,
    #[serde(skip)]
    pub(crate) expires_at: Instant,
}

impl BlobCommitment {
    pub fn key(&self) -> CommitmentKey {
        CommitmentKey::new(&self.content_id, &self.blob_hash, &self.custodian_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == CommitmentStatus::Active
    }

    pub fn is_expired(&self) -> bool {
        self.status == CommitmentStatus::Expired
    }

    /// Flip an `Active` commitment to `Expired` once the TTL has elapsed.
    /// Returns true on the flip.
    pub(crate) fn expire_if_due(&mut self, now: Instant) -> bool {
        if self.status == CommitmentStatus::Active && now >= self.expires_at {
            self.status = CommitmentStatus::Expired;
            return true;
        }
        false
    }

    /// Still `Pending` when the TTL ran out. Such a commitment never reaches
    /// `Expired`; the manager drops it instead.
    pub(crate) fn is_lapsed(&self, now: Instant) -> bool {
        self.status == CommitmentStatus::Pending && now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationStatus {
    pub content_id: String,
    pub blob_hash: String,
    /// Non-expired commitments.
    pub custodian_count: usize,
    pub active_replicas: usize,
    pub pending_replicas: usize,
    pub health: ReplicationHealth,
}

impl ReplicationHealth {
    pub fn classify(active_replicas: usize, custodian_count: usize) -> Self {
        if active_replicas == 0 || custodian_count == 0 {
            ReplicationHealth::Critical
        } else if (active_replicas as f64 / custodian_count as f64) < 0.5 {
            ReplicationHealth::Degraded
        } else {
            ReplicationHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthProbeResult {
    pub online: bool,
    pub accepting_blobs: bool,
    pub bandwidth_mbps: f64,
    pub latency_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustodianStats {
    pub registered_custodians: usize,
    pub total_commitments: usize,
    pub active_commitments: usize,
    pub pending_commitments: usize,
    pub expired_commitments: usize,
    pub total_probes: u64,
    pub successful_probes: u64,
    pub failed_probes: u64,
    pub total_selections: u64,
}

impl CustodianStats {
    pub fn probe_success_rate(&self) -> f64 {
        if self.total_probes == 0 {
            return 0.0;
        }
        self.successful_probes as f64 / self.total_probes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_health_thresholds() {
        assert_eq!(ReplicationHealth::classify(0, 3), ReplicationHealth::Critical);
        assert_eq!(ReplicationHealth::classify(0, 0), ReplicationHealth::Critical);
        assert_eq!(ReplicationHealth::classify(1, 3), ReplicationHealth::Degraded);
        assert_eq!(ReplicationHealth::classify(2, 4), ReplicationHealth::Healthy);
        assert_eq!(ReplicationHealth::classify(3, 3), ReplicationHealth::Healthy);
    }

    #[test]
    fn test_capability_urls_and_headroom() {
        let c = CustodianCapability::new("node-a", "http://node-a:8080/")
            .with_bandwidth(100.0)
            .with_load(0.25);
        assert_eq!(c.blob_url("abc"), "http://node-a:8080/store/abc");
        assert_eq!(c.health_url(), "http://node-a:8080/health");
        assert!((c.headroom_mbps() - 75.0).abs() < 1e-9);
        assert_eq!(c.health_score(), 0.5);
    }
}
