// Integrity verification: SHA-256 over blobs and chunks.

pub mod backend;
pub mod soft_sha256;
pub mod verifier;

pub use backend::{select_backend, DigestBackend, DigestPreference};
pub use verifier::{is_valid_hash, IntegrityVerifier, VerificationResult};
