use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use crate::source::MediaStream;

/// Bytes and digest of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub bytes: u64,
    pub sha256: String,
}

/// `.part` sibling a transfer writes to before it is renamed into place.
pub fn part_path(download_path: &Path) -> PathBuf {
    let mut name = download_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    download_path.with_file_name(name)
}

/// Drain a media stream into `download_path` via its `.part` file.
///
/// Any stale `.part` is truncated first. The data is hashed while it is
/// written, synced to disk, and only then renamed to the final name, so a
/// file under `download_path` is always complete.
pub async fn write_stream(
    mut stream: MediaStream,
    download_path: &Path,
    message_id: i64,
) -> Result<StoredFile, DownloadError> {
    let part = part_path(download_path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&part)
        .await?;

    // Incremental SHA256 so large videos are never buffered whole.
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::debug!(
                message_id,
                bytes_so_far = bytes_written,
                "Media stream broke off: {}",
                e
            );
            DownloadError::from_source(message_id, e)
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&part, download_path).await?;

    Ok(StoredFile {
        bytes: bytes_written,
        sha256: hex_digest(hasher),
    })
}

fn hex_digest(hasher: Sha256) -> String {
    use std::fmt::Write;
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// SHA-256 of a file on disk, hex encoded. Runs on the blocking pool.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex_digest(hasher))
    })
    .await
    .map_err(std::io::Error::other)?
}
