pub mod handler;

pub use handler::BlobServer;
