use thiserror::Error;

use crate::source::SourceError;

/// Failure classes the retry loop and the traversal engine act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Media handle expired; re-resolve the message before the next attempt.
    StaleReference,
    /// Transfer did not finish in time, or the transport dropped it.
    Timeout,
    /// Retrying will not help.
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleReference => "stale_reference",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
        }
    }
}

/// Typed download errors enabling retry classification.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Media reference expired for message {message_id}")]
    StaleReference { message_id: i64 },

    #[error("Transfer timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Connection reset, 5xx, rate limiting or a body cut short.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by source (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// Re-resolving an expired handle failed for good: the message was
    /// deleted or lost its media.
    #[error("Could not re-resolve message {message_id}: {reason}")]
    Resolve { message_id: i64, reason: String },
}

impl DownloadError {
    pub(crate) fn from_source(message_id: i64, e: SourceError) -> Self {
        match e {
            SourceError::StaleReference(_) => DownloadError::StaleReference { message_id },
            SourceError::Timeout(msg) | SourceError::Unavailable(msg) => {
                DownloadError::Network(msg)
            }
            SourceError::Rejected { status, reason } => DownloadError::Rejected { status, reason },
            SourceError::Malformed(reason) => DownloadError::Resolve { message_id, reason },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            DownloadError::StaleReference { .. } => FailureKind::StaleReference,
            DownloadError::Timeout { .. } | DownloadError::Network(_) => FailureKind::Timeout,
            DownloadError::Rejected { .. }
            | DownloadError::Disk(_)
            | DownloadError::Resolve { .. } => FailureKind::Permanent,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() != FailureKind::Permanent
    }
}
