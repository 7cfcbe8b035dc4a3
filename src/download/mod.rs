//! Download orchestrator: fetches one media item at a time with a fixed
//! attempt budget, refreshing expired media handles between attempts.

pub mod error;
pub mod file;
pub mod paths;

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::retry::{self, RetryAction, RetryConfig};
use crate::source::{MediaDescriptor, Message, MessageSource};
use crate::types::MessageId;

pub use error::{DownloadError, FailureKind};

/// Subset of application config consumed by the orchestrator.
/// Decoupled from CLI parsing so it can be tested independently.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub(crate) directory: PathBuf,
    pub(crate) retry: RetryConfig,
    /// Upper bound for a single transfer attempt.
    pub(crate) timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Succeeded {
        path: PathBuf,
        bytes: u64,
        sha256: String,
        attempts: u32,
        /// Identical content already existed; `path` points at that file and
        /// nothing new was kept.
        deduplicated: bool,
    },
    Failed {
        reason: String,
        kind: FailureKind,
        attempts: u32,
    },
}


pub struct DownloadOrchestrator<'a> {
    source: &'a dyn MessageSource,
    settings: DownloadSettings,
}

impl<'a> DownloadOrchestrator<'a> {
    pub fn new(source: &'a dyn MessageSource, settings: DownloadSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    /// Fetch the media of `message` into `dest`.
    ///
    /// Stale references and timeouts are retried up to the configured attempt
    /// budget with a fixed pause; before retrying a stale reference the
    /// message is fetched again for a fresh handle. Everything else fails on
    /// the first attempt. The outcome is reported, never returned as an error,
    /// and deciding what to do with a failure is left to the caller.
    pub async fn download(&self, message: &Message, dest: &Path) -> DownloadOutcome {
        let Some(media) = &message.media else {
            return DownloadOutcome::Failed {
                reason: "message has no media".to_string(),
                kind: FailureKind::Permanent,
                attempts: 0,
            };
        };

        let current = Mutex::new(media.clone());
        let needs_refresh = AtomicBool::new(false);
        let (current, needs_refresh) = (&current, &needs_refresh);
        let message_id = message.id;

        let outcome = retry::retry_with_delay(
            &self.settings.retry,
            |e: &DownloadError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            |attempt| async move {
                if needs_refresh.load(Ordering::SeqCst) {
                    let fresh = self.refresh(message_id).await?;
                    tracing::debug!(message_id, "Re-resolved media reference");
                    *current.lock().await = fresh;
                    needs_refresh.store(false, Ordering::SeqCst);
                }
                let descriptor = current.lock().await.clone();
                tracing::debug!(message_id, attempt, path = %dest.display(), "downloading");
                let result = self.attempt(message_id, &descriptor, dest).await;
                if matches!(result, Err(DownloadError::StaleReference { .. })) {
                    needs_refresh.store(true, Ordering::SeqCst);
                }
                result
            },
        )
        .await;

        let attempts = outcome.attempts;
        let stored = match outcome.result {
            Ok(stored) => stored,
            Err(e) => {
                return DownloadOutcome::Failed {
                    reason: e.to_string(),
                    kind: e.kind(),
                    attempts,
                }
            }
        };

        if let Some(existing) = paths::find_duplicate(dest, stored.bytes, &stored.sha256).await {
            match tokio::fs::remove_file(dest).await {
                Ok(()) => {
                    tracing::info!(
                        message_id,
                        "Removed duplicate {}, keeping {}",
                        dest.display(),
                        existing.display()
                    );
                    return DownloadOutcome::Succeeded {
                        path: existing,
                        bytes: stored.bytes,
                        sha256: stored.sha256,
                        attempts,
                        deduplicated: true,
                    };
                }
                Err(e) => {
                    tracing::warn!("Could not remove duplicate {}: {}", dest.display(), e);
                }
            }
        }

        let mtime_path = dest.to_path_buf();
        let ts = message.date.timestamp();
        match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, ts)).await {
            Ok(Err(e)) => tracing::warn!("Could not set mtime on {}: {}", dest.display(), e),
            Err(e) => tracing::warn!("mtime task panicked: {}", e),
            Ok(Ok(())) => {}
        }

        DownloadOutcome::Succeeded {
            path: dest.to_path_buf(),
            bytes: stored.bytes,
            sha256: stored.sha256,
            attempts,
            deduplicated: false,
        }
    }

    /// Fetch the message again to obtain a fresh media handle.
    async fn refresh(&self, message_id: MessageId) -> Result<MediaDescriptor, DownloadError> {
        match self.source.fetch_message(message_id).await {
            Ok(Some(message)) => message.media.ok_or_else(|| DownloadError::Resolve {
                message_id,
                reason: "message no longer has media".to_string(),
            }),
            Ok(None) => Err(DownloadError::Resolve {
                message_id,
                reason: "message was deleted".to_string(),
            }),
            Err(e) => Err(DownloadError::from_source(message_id, e)),
        }
    }

    /// One bounded transfer attempt. Leaves no `.part` file behind on failure.
    async fn attempt(
        &self,
        message_id: MessageId,
        media: &MediaDescriptor,
        dest: &Path,
    ) -> Result<file::StoredFile, DownloadError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let transfer = async {
            let stream = self
                .source
                .fetch_media(media)
                .await
                .map_err(|e| DownloadError::from_source(message_id, e))?;
            file::write_stream(stream, dest, message_id).await
        };

        let result = match tokio::time::timeout(self.settings.timeout, transfer).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout {
                secs: self.settings.timeout.as_secs(),
            }),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(file::part_path(dest)).await;
        }
        result
    }
}

/// Set the modification and access times of a file to the given Unix
/// timestamp, clamping dates before 1970 to the epoch.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        SystemTime::UNIX_EPOCH
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}
