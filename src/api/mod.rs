// Public entry points: the engine facade and process-wide tracing setup.

pub mod engine_api;
pub mod telemetry;

pub use engine_api::{
    BlobEngine, BlobOrigin, ContentMetadataProvider, Placement, RetrievedBlob,
};
pub use telemetry::init_tracing;
