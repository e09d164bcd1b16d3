// Transport abstraction: pluggable byte sources addressed by URL.

pub mod http_source;
pub mod traits;

pub use http_source::HttpTransport;
pub use traits::{BlobTransport, SourceInfo};
