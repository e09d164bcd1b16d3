// Digest capability interface with an accelerated and a portable implementation.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use super::soft_sha256::SoftSha256;

/// Streaming digest handed out by a backend.
pub trait IncrementalDigest: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> [u8; 32];
}

/// A SHA-256 implementation. Every backend produces identical digests.
pub trait DigestBackend: Send + Sync {
    /// Implementation tag reported to callers.
    fn name(&self) -> &'static str;
    fn is_hardware_accelerated(&self) -> bool;
    fn hasher(&self) -> Box<dyn IncrementalDigest>;

    fn digest(&self, data: &[u8]) -> [u8; 32] {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

/// `sha2` backend; dispatches to SHA-NI / ARMv8 crypto instructions at runtime.
pub struct AcceleratedSha256;

struct Sha2Digest(Sha256);

impl IncrementalDigest for Sha2Digest {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl DigestBackend for AcceleratedSha256 {
    fn name(&self) -> &'static str {
        "sha2-accelerated"
    }

    fn is_hardware_accelerated(&self) -> bool {
        true
    }

    fn hasher(&self) -> Box<dyn IncrementalDigest> {
        Box::new(Sha2Digest(Sha256::new()))
    }
}

/// Pure-software reference backend.
pub struct SoftwareSha256;

impl IncrementalDigest for SoftSha256 {
    fn update(&mut self, data: &[u8]) {
        SoftSha256::update(self, data);
    }

    fn finalize(self: Box<Self>) -> [u8; 32] {
        SoftSha256::finalize(*self)
    }
}

impl DigestBackend for SoftwareSha256 {
    fn name(&self) -> &'static str {
        "software"
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    fn hasher(&self) -> Box<dyn IncrementalDigest> {
        Box::new(SoftSha256::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestPreference {
    #[default]
    Auto,
    Accelerated,
    Software,
}

/// Whether the running CPU exposes SHA-256 instructions.
pub fn cpu_has_sha_extensions() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        std::is_x86_feature_detected!("sha") && std::is_x86_feature_detected!("sse4.1")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("sha2")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Pick the digest backend once, at start-up.
pub fn select_backend(pref: DigestPreference) -> Arc<dyn DigestBackend> {
    let backend: Arc<dyn DigestBackend> = match pref {
        DigestPreference::Accelerated => Arc::new(AcceleratedSha256),
        DigestPreference::Software => Arc::new(SoftwareSha256),
        DigestPreference::Auto => {
            if cpu_has_sha_extensions() {
                Arc::new(AcceleratedSha256)
            } else {
                Arc::new(SoftwareSha256)
            }
        }
    };
    info!("digest backend selected: {}", backend.name());
    backend
}
