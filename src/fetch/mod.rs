pub mod fallback;
pub mod health;

pub use fallback::{FallbackFetcher, FetchOutcome};
pub use health::{UrlHealth, UrlHealthRegistry};
