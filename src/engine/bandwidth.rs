// Bandwidth probing against a source URL and bitrate-variant selection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ProbeConfig, PROBE_UNCERTAINTY};
use crate::error::{BlobError, Result};
use crate::model::ContentBlob;
use crate::source::traits::BlobTransport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthProbe {
    pub average_speed_mbps: f64,
    pub min_speed_mbps: f64,
    pub max_speed_mbps: f64,
    /// Bytes actually received during the probe.
    pub probe_data_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityRecommendation {
    /// Variant label, or `"default"` when the blob has no variants.
    pub variant: String,
    pub bitrate_mbps: f64,
    /// In (0, 1]: how well the chosen bitrate matches the available bandwidth.
    pub reasoning_score: f64,
}

struct CachedProbe {
    probe: BandwidthProbe,
    at: Instant,
}

pub struct BandwidthProber {
    transport: Arc<dyn BlobTransport>,
    cache: DashMap<String, CachedProbe>,
    config: ProbeConfig,
}

impl BandwidthProber {
    pub fn new(transport: Arc<dyn BlobTransport>, config: ProbeConfig) -> Self {
        Self {
            transport,
            cache: DashMap::new(),
            config,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs)
    }

    /// Probe result for `url` if one was taken within the cache TTL.
    pub fn cached_probe(&self, url: &str) -> Option<BandwidthProbe> {
        let entry = self.cache.get(url)?;
        if entry.at.elapsed() < self.ttl() {
            Some(entry.probe.clone())
        } else {
            None
        }
    }

    pub fn clear_probe_cache(&self) {
        self.cache.clear();
    }

    /// Download the first `sample_size_bytes` of `url` and derive a throughput estimate.
    pub async fn probe_bandwidth(
        &self,
        url: &str,
        sample_size_bytes: Option<u64>,
    ) -> Result<BandwidthProbe> {
        if let Some(hit) = self.cached_probe(url) {
            debug!("bandwidth probe cache hit url={}", url);
            return Ok(hit);
        }

        let sample = sample_size_bytes
            .unwrap_or(self.config.sample_size_bytes)
            .max(1);
        let timeout = Duration::from_millis(self.config.timeout_ms);

        let t0 = Instant::now();
        let data = match tokio::time::timeout(
            timeout,
            self.transport.fetch_range(url, 0, sample - 1),
        )
        .await
        {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                warn!("bandwidth probe failed url={}: {}", url, e);
                return Err(BlobError::Unavailable(format!(
                    "bandwidth probe failed for {}: {}",
                    url, e
                )));
            }
            Err(_) => {
                warn!("bandwidth probe timed out url={}", url);
                return Err(BlobError::Unavailable(format!(
                    "bandwidth probe failed for {}: timed out after {}ms",
                    url, self.config.timeout_ms
                )));
            }
        };
        // Floor at 1ms so an instant local response does not divide by zero.
        let elapsed = t0.elapsed().as_secs_f64().max(0.001);

        let bytes = data.len() as u64;
        let average = (bytes as f64 * 8.0) / elapsed / 1_000_000.0;
        let probe = BandwidthProbe {
            average_speed_mbps: average,
            min_speed_mbps: average * (1.0 - PROBE_UNCERTAINTY),
            max_speed_mbps: average * (1.0 + PROBE_UNCERTAINTY),
            probe_data_size: bytes,
        };
        info!(
            "bandwidth probe url={} bytes={} avg={:.2}Mbps",
            url, bytes, probe.average_speed_mbps
        );

        self.cache.insert(
            url.to_string(),
            CachedProbe {
                probe: probe.clone(),
                at: Instant::now(),
            },
        );
        Ok(probe)
    }
}

/// Pick the richest variant that fits `bandwidth_mbps`, or the leanest one if none fits.
pub fn recommend_quality(blob: &ContentBlob, bandwidth_mbps: f64) -> QualityRecommendation {
    // NaN, infinite or negative measurements count as no bandwidth at all.
    let bandwidth_mbps = if bandwidth_mbps.is_finite() {
        bandwidth_mbps.max(0.0)
    } else {
        0.0
    };
    if blob.variants.is_empty() {
        return QualityRecommendation {
            variant: "default".to_string(),
            bitrate_mbps: blob.bitrate_mbps.unwrap_or(0.0),
            reasoning_score: 1.0,
        };
    }

    let best_fit = blob
        .variants
        .iter()
        .filter(|v| v.bitrate_mbps <= bandwidth_mbps)
        .max_by(|a, b| a.bitrate_mbps.total_cmp(&b.bitrate_mbps));

    if let Some(v) = best_fit {
        let score = if bandwidth_mbps > 0.0 {
            (v.bitrate_mbps / bandwidth_mbps).clamp(0.01, 1.0)
        } else {
            1.0
        };
        return QualityRecommendation {
            variant: v.label.clone(),
            bitrate_mbps: v.bitrate_mbps,
            reasoning_score: score,
        };
    }

    // Nothing fits; degrade to the lowest bitrate rather than refuse playback.
    let lowest = blob
        .variants
        .iter()
        .min_by(|a, b| a.bitrate_mbps.total_cmp(&b.bitrate_mbps));
    match lowest {
        Some(v) => {
            let score = if v.bitrate_mbps > 0.0 {
                (bandwidth_mbps / v.bitrate_mbps).clamp(0.01, 1.0)
            } else {
                0.01
            };
            debug!(
                "no variant fits {:.2}Mbps, falling back to {} ({:.2}Mbps)",
                bandwidth_mbps, v.label, v.bitrate_mbps
            );
            QualityRecommendation {
                variant: v.label.clone(),
                bitrate_mbps: v.bitrate_mbps,
                reasoning_score: score,
            }
        }
        None => QualityRecommendation {
            variant: "default".to_string(),
            bitrate_mbps: blob.bitrate_mbps.unwrap_or(0.0),
            reasoning_score: 1.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlobVariant;
    use crate::source::traits::SourceInfo;
    use anyhow::anyhow;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves ranges after a fixed delay; `None` delay means the source is down.
    struct DelayedSource {
        delay: Option<Duration>,
        fetches: AtomicUsize,
    }

    impl DelayedSource {
        fn new(delay: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl BlobTransport for DelayedSource {
        async fn probe(&self, _url: &str) -> anyhow::Result<SourceInfo> {
            Err(anyhow!("not used"))
        }

        async fn fetch(&self, _url: &str) -> anyhow::Result<Bytes> {
            Err(anyhow!("not used"))
        }

        async fn fetch_range(&self, _url: &str, start: u64, end: u64) -> anyhow::Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay.ok_or_else(|| anyhow!("connection refused"))?;
            tokio::time::sleep(delay).await;
            Ok(Bytes::from(vec![0u8; (end - start + 1) as usize]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_estimate_is_bracketed_and_cached_for_ten_minutes() {
        let source = DelayedSource::new(Some(Duration::from_millis(100)));
        let prober = BandwidthProber::new(source.clone(), ProbeConfig::default());

        // 125 kB in 100 ms is 10 Mbps.
        let probe = prober.probe_bandwidth("http://cdn/a", Some(125_000)).await.unwrap();
        assert_eq!(probe.probe_data_size, 125_000);
        assert!((probe.average_speed_mbps - 10.0).abs() < 1e-6, "{probe:?}");
        assert!((probe.min_speed_mbps - 8.0).abs() < 1e-6);
        assert!((probe.max_speed_mbps - 12.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert_eq!(prober.probe_bandwidth("http://cdn/a", None).await.unwrap(), probe);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(prober.cached_probe("http://cdn/a").is_none());
        prober.probe_bandwidth("http://cdn/a", Some(125_000)).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        prober.clear_probe_cache();
        assert!(prober.cached_probe("http://cdn/a").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_source_has_no_bandwidth_estimate() {
        let prober = BandwidthProber::new(DelayedSource::new(None), ProbeConfig::default());
        let err = prober.probe_bandwidth("http://down/a", None).await.unwrap_err();
        assert!(matches!(err, BlobError::Unavailable(_)), "{err:?}");
        assert!(prober.cached_probe("http://down/a").is_none());
    }

    fn ladder() -> ContentBlob {
        ContentBlob::new("h", 1, "video/mp4")
            .with_variant(BlobVariant::new("480p", 1.5))
            .with_variant(BlobVariant::new("1080p", 6.0))
            .with_variant(BlobVariant::new("720p", 3.0))
    }

    #[test]
    fn test_no_variants_uses_default() {
        let blob = ContentBlob::new("h", 1, "video/mp4").with_bitrate(2.5);
        let rec = recommend_quality(&blob, 10.0);
        assert_eq!(rec.variant, "default");
        assert_eq!(rec.bitrate_mbps, 2.5);
        assert_eq!(rec.reasoning_score, 1.0);
    }

    #[test]
    fn test_picks_highest_fitting_variant() {
        let rec = recommend_quality(&ladder(), 4.0);
        assert_eq!(rec.variant, "720p");
        assert!((rec.reasoning_score - 0.75).abs() < 1e-9);

        let rec = recommend_quality(&ladder(), 6.0);
        assert_eq!(rec.variant, "1080p");
        assert_eq!(rec.reasoning_score, 1.0);
    }

    #[test]
    fn test_common_ladder_choices() {
        let blob = ContentBlob::new("h", 1, "video/mp4")
            .with_variant(BlobVariant::new("480p", 1.5))
            .with_variant(BlobVariant::new("720p", 3.0))
            .with_variant(BlobVariant::new("1080p", 5.0));
        assert_eq!(recommend_quality(&blob, 2.0).variant, "480p");
        assert_eq!(recommend_quality(&blob, 10.0).variant, "1080p");
    }

    #[test]
    fn test_more_bandwidth_never_lowers_bitrate() {
        let blob = ladder();
        let mut previous = 0.0;
        for step in 0..=200 {
            let bandwidth = step as f64 * 0.05;
            let rec = recommend_quality(&blob, bandwidth);
            assert!(rec.bitrate_mbps >= previous, "dropped at {bandwidth} Mbps");
            assert!(rec.reasoning_score > 0.0 && rec.reasoning_score <= 1.0);
            previous = rec.bitrate_mbps;
        }
    }

    #[test]
    fn test_unusable_bandwidth_counts_as_none() {
        for bandwidth in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -3.0] {
            let rec = recommend_quality(&ladder(), bandwidth);
            assert_eq!(rec.variant, "480p");
            assert!(rec.reasoning_score > 0.0 && rec.reasoning_score <= 1.0);
        }
    }

    #[test]
    fn test_falls_back_to_lowest_when_nothing_fits() {
        let rec = recommend_quality(&ladder(), 0.75);
        assert_eq!(rec.variant, "480p");
        assert!((rec.reasoning_score - 0.5).abs() < 1e-9);

        let rec = recommend_quality(&ladder(), 0.0);
        assert_eq!(rec.variant, "480p");
        assert!(rec.reasoning_score > 0.0);
    }
}
