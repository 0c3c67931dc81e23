//! Fetching channel metadata over `https://` and `file://`.

use std::io::Read;
use std::path::PathBuf;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataFetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON from {url}: {source}")]
    Json {
        url: String,
        source: serde_json::Error,
    },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Archive error: {0}")]
    Archive(String),
}

/// The local path of a `file://` URL.
pub fn file_url_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Fetch a URL. A missing resource is `Ok(None)`, not an error.
pub async fn fetch_bytes(client: &Client, url: &str) -> Result<Option<Vec<u8>>, MetadataFetchError> {
    if let Some(path) = file_url_path(url) {
        return match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
    }

    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
        .send()
        .await?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let bytes = response.error_for_status()?.bytes().await?;
    Ok(Some(bytes.to_vec()))
}

/// Fetch and decode JSON. `.zst` URLs are decompressed first.
pub async fn fetch_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
) -> Result<Option<T>, MetadataFetchError> {
    let Some(mut bytes) = fetch_bytes(client, url).await? else {
        return Ok(None);
    };
    if url.ends_with(".zst") {
        let mut decoded = Vec::new();
        zstd::stream::Decoder::new(bytes.as_slice())?.read_to_end(&mut decoded)?;
        bytes = decoded;
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| MetadataFetchError::Json {
            url: url.to_string(),
            source,
        })
}
