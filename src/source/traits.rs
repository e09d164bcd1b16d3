use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub struct SourceInfo {
    pub content_length: u64,
    pub content_type: String,
    pub supports_range: bool,
}

/// Byte transport addressed by URL. Every call is one network attempt;
/// retries and fallback live above this seam.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Issue `Range: bytes=0-0` and report what the source answered.
    async fn probe(&self, url: &str) -> Result<SourceInfo>;
    /// Fetch the whole resource.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
    /// Fetch the inclusive byte range `[start, end]`.
    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes>;
}
