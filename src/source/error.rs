use thiserror::Error;

/// Errors reported by a remote message source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The media handle expired; the message must be fetched again to get a
    /// fresh one.
    #[error("Media reference expired: {0}")]
    StaleReference(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transport-level failure (connection refused, 5xx, broken body).
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The source refused the request for a reason retrying will not fix
    /// (permission denied, quota exceeded, file too large).
    #[error("Rejected by source (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(e.to_string())
        } else if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            SourceError::Unavailable(e.to_string())
        }
    }
}
