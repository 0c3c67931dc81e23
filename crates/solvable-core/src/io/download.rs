//! Artifact download with streaming SHA256 verification.

use std::io::Write;
use std::path::Path;

use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::http::{MetadataFetchError, file_url_path};

/// Download `url` to `dest`, returning the SHA256 of the written file.
///
/// When `expected_hash` is given and does not match, `dest` is removed and
/// [`MetadataFetchError::HashMismatch`] returned.
pub async fn download_artifact(
    client: &Client,
    url: &str,
    dest: &Path,
    expected_hash: Option<&str>,
) -> Result<String, MetadataFetchError> {
    let mut file = File::create(dest).await?;
    let mut hasher = Sha256::new();

    if let Some(path) = file_url_path(url) {
        let bytes = tokio::fs::read(&path).await?;
        file.write_all(&bytes).await?;
        hasher.update(&bytes);
    } else {
        let response = client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.write_all(&chunk)?;
        }
    }

    file.flush().await?;
    let actual_hash = hex::encode(hasher.finalize());

    if let Some(expected) = expected_hash {
        if !actual_hash.eq_ignore_ascii_case(expected) {
            tokio::fs::remove_file(dest).await.ok();
            return Err(MetadataFetchError::HashMismatch {
                expected: expected.to_string(),
                actual: actual_hash,
            });
        }
    }

    Ok(actual_hash)
}
