pub mod download;
pub mod extract;
pub mod http;

pub use http::{MetadataFetchError, fetch_bytes, fetch_json};
