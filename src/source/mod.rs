//! Remote message source: the data model read from a chat and the narrow
//! async interface the export pipeline pulls it through.

pub mod error;
pub mod http;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::types::{MediaKind, MessageId};

pub use error::SourceError;
pub use http::HttpSource;

/// Media payload bytes, delivered in chunks as they arrive.
pub type MediaStream = BoxStream<'static, Result<Vec<u8>, SourceError>>;

/// Who sent a message. Both parts are optional because channels post
/// anonymously.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    /// Opaque handle used to fetch the bytes. May expire.
    pub remote_reference: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Explicit format (file extension or container) when the source knows it.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub byte_size: u64,
}

impl MediaDescriptor {
    /// Lower-case format used for filtering and for fallback file names.
    ///
    /// Resolution order: explicit `format`, MIME subtype, extension of the
    /// original file name, then `jpg` for photos which arrive without any
    /// of these.
    pub fn effective_format(&self) -> Option<String> {
        if let Some(format) = self.format.as_deref().filter(|f| !f.is_empty()) {
            return Some(format.trim_start_matches('.').to_ascii_lowercase());
        }
        if let Some(subtype) = self
            .mime_type
            .as_deref()
            .and_then(|m| m.rsplit('/').next())
            .filter(|s| !s.is_empty())
        {
            return Some(subtype.to_ascii_lowercase());
        }
        if let Some(ext) = self
            .file_name
            .as_deref()
            .and_then(|n| n.rsplit_once('.'))
            .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
            .map(|(_, ext)| ext)
        {
            return Some(ext.to_ascii_lowercase());
        }
        if self.kind == MediaKind::Photo {
            return Some("jpg".to_string());
        }
        None
    }
}

/// Immutable record read from the remote chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub views: Option<u64>,
    #[serde(default)]
    pub forwards: Option<u64>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
}

/// Read-only access to one chat's history.
///
/// Implementations must return batches in ascending id order, containing
/// only ids strictly greater than the cursor passed in. An empty batch
/// means the history is exhausted.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_messages_after(
        &self,
        cursor: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError>;

    /// Fetch a single message again, e.g. to refresh an expired media
    /// handle. `Ok(None)` means the message no longer exists.
    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, SourceError>;

    /// Open the byte stream behind a media handle.
    async fn fetch_media(&self, media: &MediaDescriptor) -> Result<MediaStream, SourceError>;
}
