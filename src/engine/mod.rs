// Engine internals: bandwidth probing, chunked downloads, start-up state and stats.

pub mod bandwidth;
pub mod bootstrap;
pub mod downloader;
pub mod stats;
