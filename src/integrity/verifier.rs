// Blob and chunk verification against expected SHA-256 hashes.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{select_backend, DigestBackend, DigestPreference, IncrementalDigest};
use crate::error::{BlobError, Result};

/// Outcome of a hash check. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub computed_hash: String,
    pub expected_hash: String,
    pub duration_ms: u64,
    pub used_hardware_accel: bool,
    pub error: Option<String>,
}

/// True for a 64-character hex string (either case).
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    backend: Arc<dyn DigestBackend>,
}

impl IntegrityVerifier {
    pub fn new(backend: Arc<dyn DigestBackend>) -> Self {
        Self { backend }
    }

    /// Verifier with the best backend the CPU supports.
    pub fn detect() -> Self {
        Self::new(select_backend(DigestPreference::Auto))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn uses_hardware_accel(&self) -> bool {
        self.backend.is_hardware_accelerated()
    }

    /// Lowercase hex SHA-256 of `data`, computed off the async executor.
    pub async fn compute_hash(&self, data: Bytes) -> Result<String> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || hex::encode(backend.digest(&data)))
            .await
            .map_err(|e| BlobError::Unavailable(format!("hash task failed: {}", e)))
    }

    pub async fn verify_blob(&self, data: Bytes, expected_hash: &str) -> VerificationResult {
        let t0 = Instant::now();
        let expected = expected_hash.trim().to_ascii_lowercase();
        let used_hardware_accel = self.backend.is_hardware_accelerated();

        match self.compute_hash(data).await {
            Ok(computed) => {
                let is_valid = computed == expected;
                let error = if is_valid {
                    None
                } else if !is_valid_hash(&expected) {
                    Some(format!("expected hash {:?} is not 64 hex characters", expected_hash))
                } else {
                    Some(format!("hash mismatch: expected {}, got {}", expected, computed))
                };
                if !is_valid {
                    warn!("integrity check failed expected={} computed={}", expected, computed);
                }
                VerificationResult {
                    is_valid,
                    computed_hash: computed,
                    expected_hash: expected,
                    duration_ms: t0.elapsed().as_millis() as u64,
                    used_hardware_accel,
                    error,
                }
            }
            Err(e) => VerificationResult {
                is_valid: false,
                computed_hash: String::new(),
                expected_hash: expected,
                duration_ms: t0.elapsed().as_millis() as u64,
                used_hardware_accel,
                error: Some(e.to_string()),
            },
        }
    }

    /// Same contract as [`verify_blob`](Self::verify_blob), for a single downloaded chunk.
    pub async fn verify_chunk(&self, chunk: Bytes, expected_hash: &str) -> VerificationResult {
        self.verify_blob(chunk, expected_hash).await
    }

    /// Hash `data` in `chunk_size` pieces, reporting `(processed, total)` after each.
    pub async fn stream_compute_hash<F>(
        &self,
        data: &[u8],
        chunk_size: usize,
        mut on_progress: F,
    ) -> String
    where
        F: FnMut(u64, u64),
    {
        let total = data.len() as u64;
        let step = if chunk_size == 0 { data.len().max(1) } else { chunk_size };
        let mut hasher = self.backend.hasher();
        let mut processed = 0u64;

        for piece in data.chunks(step) {
            hasher.update(piece);
            processed += piece.len() as u64;
            on_progress(processed, total);
            tokio::task::yield_now().await;
        }
        if data.is_empty() {
            on_progress(0, 0);
        }

        let digest = hex::encode(hasher.finalize());
        debug!("streamed hash over {} bytes: {}", total, digest);
        digest
    }

    /// Verify many `(data, expected_hash)` pairs concurrently; results keep input order.
    pub async fn verify_multiple(&self, pairs: Vec<(Bytes, String)>) -> Vec<VerificationResult> {
        let checks = pairs
            .into_iter()
            .map(|(data, expected)| async move { self.verify_blob(data, &expected).await });
        join_all(checks).await
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::backend::SoftwareSha256;

    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[tokio::test]
    async fn test_verify_blob_is_case_insensitive() {
        let v = IntegrityVerifier::detect();
        let result = v
            .verify_blob(Bytes::from_static(b"abc"), &ABC.to_uppercase())
            .await;
        assert!(result.is_valid);
        assert_eq!(result.computed_hash, ABC);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_mismatch_is_reported_not_raised() {
        let v = IntegrityVerifier::new(Arc::new(SoftwareSha256));
        let result = v.verify_blob(Bytes::from_static(b"abd"), ABC).await;
        assert!(!result.is_valid);
        assert!(!result.used_hardware_accel);
        assert!(result.error.unwrap().contains("hash mismatch"));
    }

    #[tokio::test]
    async fn test_stream_compute_hash_reports_progress() {
        let v = IntegrityVerifier::detect();
        let data = vec![7u8; 1000];
        let mut progress = Vec::new();
        let streamed = v
            .stream_compute_hash(&data, 300, |done, total| progress.push((done, total)))
            .await;
        assert_eq!(progress, vec![(300, 1000), (600, 1000), (900, 1000), (1000, 1000)]);
        assert_eq!(streamed, v.compute_hash(Bytes::from(data)).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_multiple_preserves_order() {
        let v = IntegrityVerifier::detect();
        let results = v
            .verify_multiple(vec![
                (Bytes::from_static(b"abc"), ABC.to_string()),
                (Bytes::from_static(b"nope"), ABC.to_string()),
                (Bytes::from_static(b"abc"), ABC.to_string()),
            ])
            .await;
        let flags: Vec<bool> = results.iter().map(|r| r.is_valid).collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[test]
    fn test_is_valid_hash() {
        assert!(is_valid_hash(ABC));
        assert!(!is_valid_hash("abc"));
        assert!(!is_valid_hash(&"g".repeat(64)));
    }
}
