// Ordered-source fetcher: walks fallback URLs with per-URL retries and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::health::{UrlHealth, UrlHealthRegistry};
use crate::config::FetchConfig;
use crate::engine::stats::StatsCollector;
use crate::error::{BlobError, Result};
use crate::source::traits::BlobTransport;

/// Successful result of [`FallbackFetcher::fetch_with_fallback`].
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    #[serde(skip)]
    pub data: Bytes,
    /// Position of the winning URL in the caller's list.
    pub url_index: usize,
    pub success_url: String,
    /// Failed attempts against the winning URL before it succeeded.
    pub retry_count: u32,
    pub duration_ms: u64,
}

pub struct FallbackFetcher {
    transport: Arc<dyn BlobTransport>,
    health: Arc<UrlHealthRegistry>,
    stats: Arc<StatsCollector>,
    config: FetchConfig,
}

impl FallbackFetcher {
    pub fn new(
        transport: Arc<dyn BlobTransport>,
        config: FetchConfig,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            transport,
            health: Arc::new(UrlHealthRegistry::new()),
            stats,
            config,
        }
    }

    pub fn health(&self) -> &Arc<UrlHealthRegistry> {
        &self.health
    }

    pub fn url_health(&self, url: &str) -> Option<UrlHealth> {
        self.health.get(url)
    }

    pub fn clear_url_health(&self) {
        self.health.clear();
    }

    /// Reorder `urls` so that URLs with a healthy record come first.
    pub fn healthy_first(&self, urls: &[String]) -> Vec<String> {
        self.health.healthy_first(urls)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }

    async fn attempt(&self, url: &str, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.transport.fetch(url)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(BlobError::Network(e.to_string())),
            Err(_) => Err(BlobError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Try every URL in order until one returns the blob.
    ///
    /// Each URL gets one attempt plus `max_retries` retries, separated by
    /// `backoff_base_ms * 2^n`. `None` arguments fall back to the configured values.
    pub async fn fetch_with_fallback(
        &self,
        urls: &[String],
        timeout: Option<Duration>,
        max_retries: Option<u32>,
    ) -> Result<FetchOutcome> {
        if urls.is_empty() {
            return Err(BlobError::Input("No fallback URLs provided".to_string()));
        }

        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let t0 = Instant::now();
        let mut last_error: Option<BlobError> = None;

        for (url_index, url) in urls.iter().enumerate() {
            for attempt in 0..=max_retries {
                match self.attempt(url, timeout).await {
                    Ok(data) => {
                        self.health.record_success(url);
                        self.stats.record_downloaded(data.len() as u64);
                        let duration_ms = t0.elapsed().as_millis() as u64;
                        info!(
                            "fetched {} bytes from url[{}]={} retries={} in {}ms",
                            data.len(),
                            url_index,
                            url,
                            attempt,
                            duration_ms
                        );
                        return Ok(FetchOutcome {
                            data,
                            url_index,
                            success_url: url.clone(),
                            retry_count: attempt,
                            duration_ms,
                        });
                    }
                    Err(e) => {
                        self.health.record_failure(url, e.to_string());
                        if attempt < max_retries {
                            let delay = self.backoff_delay(attempt);
                            warn!(
                                "fetch failed url={} (attempt {}): {}; retrying in {:?}",
                                url, attempt, e, delay
                            );
                            tokio::time::sleep(delay).await;
                        } else {
                            warn!("fetch failed url={} after {} retries: {}", url, max_retries, e);
                        }
                        last_error = Some(e);
                    }
                }
            }
            debug!("moving past url[{}]={}", url_index, url);
        }

        let detail = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        Err(BlobError::Exhausted(format!(
            "All fallback URLs exhausted: {}",
            detail
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::source::traits::SourceInfo;

    type Scripted = Option<std::result::Result<&'static [u8], &'static str>>;

    /// Replays a scripted sequence of outcomes per URL; `None` means "hang".
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<HashMap<String, Vec<Scripted>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn push(&self, url: &str, outcome: Scripted) {
            self.script.lock().entry(url.to_string()).or_default().push(outcome);
        }
    }

    #[async_trait]
    impl BlobTransport for ScriptedTransport {
        async fn probe(&self, _url: &str) -> anyhow::Result<SourceInfo> {
            Err(anyhow!("not scripted"))
        }

        async fn fetch(&self, url: &str) -> anyhow::Result<Bytes> {
            self.calls.lock().push(url.to_string());
            let next = {
                let mut script = self.script.lock();
                let queue = script.entry(url.to_string()).or_default();
                if queue.is_empty() {
                    Some(Err("connection refused"))
                } else {
                    queue.remove(0)
                }
            };
            match next {
                Some(Ok(body)) => Ok(Bytes::from_static(body)),
                Some(Err(msg)) => Err(anyhow!(msg)),
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn fetch_range(&self, _url: &str, _start: u64, _end: u64) -> anyhow::Result<Bytes> {
            Err(anyhow!("not scripted"))
        }
    }

    fn fetcher(transport: Arc<ScriptedTransport>) -> FallbackFetcher {
        FallbackFetcher::new(transport, FetchConfig::default(), Arc::new(StatsCollector::new()))
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_url_list_is_input_error() {
        let f = fetcher(Arc::new(ScriptedTransport::default()));
        let err = f.fetch_with_fallback(&[], None, None).await.unwrap_err();
        assert!(matches!(err, BlobError::Input(_)));
        assert_eq!(err.to_string(), "No fallback URLs provided");
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_to_second_url() {
        let t = Arc::new(ScriptedTransport::default());
        t.push("http://b", Some(Ok(b"payload")));
        let f = fetcher(Arc::clone(&t));

        let out = f
            .fetch_with_fallback(&urls(&["http://a", "http://b"]), None, Some(1))
            .await
            .unwrap();
        assert_eq!(out.url_index, 1);
        assert_eq!(out.success_url, "http://b");
        assert_eq!(out.retry_count, 0);
        assert_eq!(&out.data[..], b"payload");

        // Two attempts on the first URL, one on the second.
        assert_eq!(t.calls.lock().len(), 3);
        assert_eq!(f.url_health("http://a").unwrap().failure_count, 2);
        assert!(!f.health().is_healthy("http://a"));
        assert_eq!(f.url_health("http://b").unwrap().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_and_backoff_schedule() {
        let t = Arc::new(ScriptedTransport::default());
        t.push("http://a", Some(Err("reset")));
        t.push("http://a", Some(Err("reset")));
        t.push("http://a", Some(Ok(b"ok")));
        let f = fetcher(Arc::clone(&t));

        let started = Instant::now();
        let out = f
            .fetch_with_fallback(&urls(&["http://a"]), None, Some(3))
            .await
            .unwrap();
        assert_eq!(out.retry_count, 2);
        // 100ms + 200ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure_then_exhausts() {
        let t = Arc::new(ScriptedTransport::default());
        t.push("http://slow", None);
        let f = fetcher(Arc::clone(&t));

        let err = f
            .fetch_with_fallback(
                &urls(&["http://slow"]),
                Some(Duration::from_millis(50)),
                Some(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Exhausted(_)));
        assert!(err.to_string().starts_with("All fallback URLs exhausted"));

        let health = f.url_health("http://slow").unwrap();
        assert_eq!(health.failure_count, 2);
        assert!(health.last_error.unwrap().contains("timed out after 50ms"));

        f.clear_url_health();
        assert!(f.url_health("http://slow").is_none());
    }

    #[test]
    fn test_backoff_doubles() {
        let f = fetcher(Arc::new(ScriptedTransport::default()));
        assert_eq!(f.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(f.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(f.backoff_delay(2), Duration::from_millis(400));
    }
}
