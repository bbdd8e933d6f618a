//! Artifact download and storage
//!
//! Writes a generated image to the output directory. Inline data URIs are
//! decoded in place; anything else is fetched over HTTP and streamed to disk.
//! Output names are claimed atomically so concurrent tasks sharing a numeric
//! key never overwrite each other. Failures here are final for the task.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use reqwest::{Client, Response};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Total timeout for one artifact download
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Error types for artifact storage
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("Invalid inline image data: {0}")]
    Decode(String),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Download manager configuration
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub timeout_seconds: u64,
    pub allow_insecure_ssl: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DOWNLOAD_TIMEOUT_SECS,
            allow_insecure_ssl: false,
        }
    }
}

/// Anything that can persist a result locator under a numeric key
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the artifact and return the local file name (not the full path)
    async fn fetch_and_store(&self, locator: &str, key: &str, destination: &Path) -> DownloadResult<String>;
}

/// Candidate file name for the `n`-th claim of `key`; path separators never reach the file system
fn candidate_name(key: &str, n: u32) -> String {
    let key = key.trim().replace(['/', '\\'], "_");
    if n <= 1 {
        format!("{}.png", key)
    } else {
        format!("{}-{}.png", key, n)
    }
}

/// Create the first unused `{key}.png`, `{key}-2.png`, ... in `dir`
pub async fn claim_unique_file(dir: &Path, key: &str) -> std::io::Result<(File, PathBuf, String)> {
    let mut n = 1;
    loop {
        let name = candidate_name(key, n);
        let path = dir.join(&name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path, name)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Decode the payload of a `data:<mime>;base64,<payload>` locator
fn decode_data_uri(locator: &str) -> DownloadResult<Vec<u8>> {
    let (_, payload) = locator
        .split_once(',')
        .ok_or_else(|| DownloadError::Decode("missing ',' separator".to_string()))?;
    BASE64
        .decode(payload.trim())
        .map_err(|e| DownloadError::Decode(e.to_string()))
}

/// Stores generated images in a local directory
pub struct DownloadManager {
    client: Client,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new(config: DownloadConfig) -> DownloadResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(config.allow_insecure_ssl)
            .build()?;

        debug!("Initialized download manager with {}s timeout", config.timeout_seconds);
        Ok(Self { client })
    }

    /// Stream a response to a file
    async fn stream_to_file(response: Response, file: &mut File) -> DownloadResult<u64> {
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(written)
    }

    async fn write_artifact(&self, locator: &str, file: &mut File) -> DownloadResult<u64> {
        if locator.starts_with("data:") {
            let bytes = decode_data_uri(locator)?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            return Ok(bytes.len() as u64);
        }

        let response = self.client.get(locator).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }
        Self::stream_to_file(response, file).await
    }
}

#[async_trait]
impl ArtifactStore for DownloadManager {
    #[instrument(skip(self, locator, destination), fields(dir = %destination.display()))]
    async fn fetch_and_store(&self, locator: &str, key: &str, destination: &Path) -> DownloadResult<String> {
        fs::create_dir_all(destination).await?;

        let (mut file, path, name) = claim_unique_file(destination, key).await?;

        match self.write_artifact(locator, &mut file).await {
            Ok(bytes) => {
                info!("Saved {} ({} bytes)", path.display(), bytes);
                Ok(name)
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&path).await {
                    warn!("Failed to remove partial file {}: {}", path.display(), cleanup);
                }
                Err(e)
            }
        }
    }
}
