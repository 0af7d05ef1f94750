//! Group cache download and extraction
//!
//! A group task may reference a cache archive produced by earlier stages. The
//! archive is streamed to `<caches>/cache.tar.gz`, unpacked into `<caches>`
//! and the handler is pointed at `<caches>/jsonlds`. Both the archive and the
//! extracted tree stay on disk until [`CacheFetcher::cleanup`] runs after the
//! task.

use futures_util::StreamExt;
use reqwest::Client;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Archive file name inside the caching directory
pub const ARCHIVE_FILE_NAME: &str = "cache.tar.gz";

/// Directory handed to group handlers, relative to the caching directory
pub const EXTRACTED_DIR_NAME: &str = "jsonlds";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Cache download and extraction errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to download cache from {url}: {message}")]
    Download { url: String, message: String },
    #[error("failed to extract cache archive: {0}")]
    Extract(String),
    #[error("cache directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads and unpacks group cache archives into a fixed directory
#[derive(Debug, Clone)]
pub struct CacheFetcher {
    client: Client,
    cache_dir: PathBuf,
}

impl CacheFetcher {
    pub fn new(client: Client, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn archive_path(&self) -> PathBuf {
        self.cache_dir.join(ARCHIVE_FILE_NAME)
    }

    /// Path returned by [`fetch`](Self::fetch), whatever the archive contains
    pub fn extracted_path(&self) -> PathBuf {
        self.cache_dir.join(EXTRACTED_DIR_NAME)
    }

    /// Download `url` and extract it, returning `<cacheDir>/jsonlds`
    ///
    /// A failed download removes the partial archive before returning.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf, CacheError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let archive = self.archive_path();
        if let Err(error) = self.download(url, &archive).await {
            if let Err(remove_error) = remove_file_if_exists(&archive).await {
                warn!(
                    path = %archive.display(),
                    error = %remove_error,
                    "Failed to remove partial cache archive"
                );
            }
            return Err(error);
        }

        let cache_dir = self.cache_dir.clone();
        let entries = tokio::task::spawn_blocking(move || unpack_archive(&archive, &cache_dir))
            .await
            .map_err(|e| CacheError::Extract(format!("extraction task failed: {e}")))??;

        info!(url, entries, cache_dir = %self.cache_dir.display(), "Cache extracted");
        Ok(self.extracted_path())
    }

    async fn download(&self, url: &str, archive: &Path) -> Result<u64, CacheError> {
        let download_error = |message: String| CacheError::Download {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {status}")));
        }

        // create() truncates whatever an earlier attempt left behind
        let mut file = tokio::fs::File::create(archive).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        debug!(url, bytes = written, "Cache archive downloaded");
        Ok(written)
    }

    /// Remove the archive and the extracted tree
    pub async fn cleanup(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(self.extracted_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        remove_file_if_exists(&self.archive_path()).await?;
        Ok(())
    }
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Unpack a gzip-compressed or plain tar archive into `dest`
///
/// Entry paths are used as-is: absolute paths stay absolute and relative ones
/// resolve against `dest`.
fn unpack_archive(archive: &Path, dest: &Path) -> Result<usize, CacheError> {
    let mut reader = BufReader::new(File::open(archive)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if is_gzip {
        unpack_entries(tar::Archive::new(flate2::read::GzDecoder::new(reader)), dest)
    } else {
        unpack_entries(tar::Archive::new(reader), dest)
    }
}

fn unpack_entries<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<usize, CacheError> {
    let extract_error = |e: std::io::Error| CacheError::Extract(e.to_string());
    let mut count = 0;

    for entry in archive.entries().map_err(extract_error)? {
        let mut entry = entry.map_err(extract_error)?;
        let entry_path = entry.path().map_err(extract_error)?.into_owned();
        let target = dest.join(&entry_path);

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(extract_error)?;
        }
        entry.unpack(&target).map_err(extract_error)?;
        count += 1;
    }

    Ok(count)
}
