pub mod manager;
pub mod probe;
pub mod types;

pub use manager::CustodianManager;
pub use probe::{HealthResponse, HttpLivenessProbe, LivenessProbe};
pub use types::{
    BlobCommitment, CommitmentKey, CommitmentStatus, CustodianCapability, CustodianStats,
    HealthProbeResult, ReplicationHealth, ReplicationStatus, SelectionCriteria,
};
