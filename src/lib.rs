pub mod api;
pub mod cache;
pub mod config;
pub mod custodian;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod integrity;
pub mod model;
pub mod server;
pub mod source;

pub use api::{BlobEngine, ContentMetadataProvider, Placement, RetrievedBlob};
pub use config::EngineConfig;
pub use error::{BlobError, Result};
pub use model::{BlobVariant, ContentBlob, ReachLevel};
