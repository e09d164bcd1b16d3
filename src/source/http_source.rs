use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::{BlobTransport, SourceInfo};

/// reqwest-backed transport shared by the fetcher, prober and downloader.
pub struct HttpTransport {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Build a transport whose client enforces `timeout` on every request.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            headers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the extra headers sent with every request (e.g. a CDN token).
    pub fn set_headers(&self, headers: HashMap<String, String>) {
        *self.headers.write() = headers;
    }

    /// Build a GET request for `url` with the custom headers and an optional Range header.
    fn build_request(&self, url: &str, range_header: Option<&str>) -> RequestBuilder {
        let headers = self.headers.read().clone();

        let mut req = self.client.get(url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(range) = range_header {
            req = req.header("Range", range);
        }
        req
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobTransport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<SourceInfo> {
        let resp = self.build_request(url, Some("bytes=0-0")).send().await?;

        let status = resp.status();
        debug!("http probe url={} status={}", url, status.as_u16());
        if !status.is_success() {
            warn!("http probe failed url={} status={}", url, status.as_u16());
            return Err(anyhow!("probe failed: HTTP {}", status.as_u16()));
        }

        // Parse Content-Range: bytes 0-0/<total>
        let supports_range = status.as_u16() == 206;
        let content_length = if supports_range {
            resp.headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        } else {
            resp.headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(SourceInfo {
            content_length,
            content_type,
            supports_range,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let resp = self.build_request(url, None).send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!("http fetch failed url={} status={}", url, status.as_u16());
            return Err(anyhow!("fetch failed: HTTP {}", status.as_u16()));
        }
        Ok(resp.bytes().await?)
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes> {
        if end < start {
            return Err(anyhow!("invalid range {}-{}", start, end));
        }
        let range = format!("bytes={}-{}", start, end);
        let resp = self.build_request(url, Some(&range)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            warn!(
                "http fetch failed url={} status={} range={}",
                url,
                status.as_u16(),
                range
            );
            return Err(anyhow!("fetch_range failed: HTTP {}", status.as_u16()));
        }

        let partial = status.as_u16() == 206;
        let bytes = resp.bytes().await?;
        if partial {
            return Ok(bytes);
        }

        // The source ignored the Range header and sent the full body.
        debug!("range ignored by source url={} range={}", url, range);
        let from = start as usize;
        let to = (end as usize + 1).min(bytes.len());
        if from >= to {
            return Err(anyhow!(
                "range {} beyond body of {} bytes",
                range,
                bytes.len()
            ));
        }
        Ok(bytes.slice(from..to))
    }
}
