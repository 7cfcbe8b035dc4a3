//! Message metadata export as JSON Lines.
//!
//! One object per accepted message, appended and flushed as soon as the
//! message is handled so an interrupted run keeps what it already wrote.
//! Ids present in the file when it is opened are not written again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::source::Message;
use crate::types::{MediaKind, MessageId};

/// Serialized form of one exported message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub message_id: MessageId,
    /// RFC 3339.
    pub date: String,
    pub text: String,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub chat_id: Option<i64>,
    pub media_type: Option<MediaKind>,
    pub media_file_name: Option<String>,
    pub views: u64,
    pub forwards: u64,
    pub is_reply: bool,
    pub reply_to_id: Option<MessageId>,
}

impl From<&Message> for ExportRecord {
    fn from(msg: &Message) -> Self {
        Self {
            message_id: msg.id,
            date: msg.date.to_rfc3339(),
            text: msg.text.clone(),
            sender_id: msg.sender.id,
            sender_name: msg.sender.name.clone(),
            chat_id: msg.chat_id,
            media_type: msg.media.as_ref().map(|m| m.kind),
            media_file_name: msg.media.as_ref().and_then(|m| m.file_name.clone()),
            views: msg.views.unwrap_or(0),
            forwards: msg.forwards.unwrap_or(0),
            is_reply: msg.reply_to_id.is_some(),
            reply_to_id: msg.reply_to_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Message export to {path} failed: {source}")]
pub struct ExportError {
    path: PathBuf,
    source: std::io::Error,
}

pub struct MessageExporter {
    file: File,
    path: PathBuf,
    seen: HashSet<MessageId>,
}

impl std::fmt::Debug for MessageExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageExporter")
            .field("path", &self.path)
            .field("records", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl MessageExporter {
    /// Open `path` for appending, loading the ids it already contains.
    pub async fn open(path: &Path) -> Result<Self, ExportError> {
        let err = |source| ExportError {
            path: path.to_path_buf(),
            source,
        };

        let (seen, needs_newline) = match tokio::fs::read_to_string(path).await {
            Ok(contents) => (
                existing_ids(&contents, path),
                !contents.is_empty() && !contents.ends_with('\n'),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashSet::new(), false),
            Err(e) => return Err(err(e)),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(err)?;
        // A crash mid-line leaves a fragment; start the next record on a
        // fresh line.
        if needs_newline {
            file.write_all(b"\n").await.map_err(err)?;
        }

        tracing::debug!(
            "Message export {} holds {} records",
            path.display(),
            seen.len()
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            seen,
        })
    }

    #[cfg(test)]
    fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    /// Append one message. Returns `false` when it was already exported.
    pub async fn record(&mut self, message: &Message) -> Result<bool, ExportError> {
        if self.seen.contains(&message.id) {
            return Ok(false);
        }
        let mut line = serde_json::to_vec(&ExportRecord::from(message)).map_err(|e| ExportError {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;
        line.push(b'\n');

        let err = |source| ExportError {
            path: self.path.clone(),
            source,
        };
        self.file.write_all(&line).await.map_err(err)?;
        self.file.flush().await.map_err(err)?;
        self.seen.insert(message.id);
        Ok(true)
    }
}

fn existing_ids(contents: &str, path: &Path) -> HashSet<MessageId> {
    #[derive(Deserialize)]
    struct IdOnly {
        message_id: MessageId,
    }

    let mut ids = HashSet::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IdOnly>(line) {
            Ok(rec) => {
                ids.insert(rec.message_id);
            }
            Err(e) => tracing::warn!(
                "Skipping unreadable line {} in {}: {}",
                n + 1,
                path.display(),
                e
            ),
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{media_message, text_message};
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("chat_export_export_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_records(path: &Path) -> Vec<ExportRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_record_fields() {
        let mut msg = media_message(12, MediaKind::Document, Some("notes.pdf"));
        msg.reply_to_id = Some(3);
        msg.views = Some(40);
        let rec = ExportRecord::from(&msg);
        assert_eq!(rec.message_id, 12);
        assert_eq!(rec.media_type, Some(MediaKind::Document));
        assert_eq!(rec.media_file_name.as_deref(), Some("notes.pdf"));
        assert!(rec.is_reply);
        assert_eq!(rec.reply_to_id, Some(3));
        assert_eq!(rec.views, 40);
        assert_eq!(rec.forwards, 0);
        assert_eq!(rec.sender_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_record_json_shape() {
        let value = serde_json::to_value(ExportRecord::from(&text_message(1))).unwrap();
        assert_eq!(value["media_type"], serde_json::Value::Null);
        assert_eq!(value["is_reply"], false);
        assert_eq!(value["date"], "2024-05-01T00:01:00+00:00");
    }

    #[tokio::test]
    async fn test_append_and_reopen_skips_existing() {
        let dir = test_dir("reopen");
        let path = dir.join("messages_export.jsonl");

        let mut exporter = MessageExporter::open(&path).await.unwrap();
        assert!(exporter.record(&text_message(1)).await.unwrap());
        assert!(exporter.record(&text_message(2)).await.unwrap());
        assert!(!exporter.record(&text_message(2)).await.unwrap());
        drop(exporter);

        let mut exporter = MessageExporter::open(&path).await.unwrap();
        assert!(exporter.contains(1));
        assert!(!exporter.record(&text_message(1)).await.unwrap());
        assert!(exporter.record(&text_message(3)).await.unwrap());
        drop(exporter);

        let ids: Vec<_> = read_records(&path).iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_truncated_last_line_is_tolerated() {
        let dir = test_dir("truncated");
        let path = dir.join("m.jsonl");
        fs::write(&path, "{\"message_id\": 5, \"date\": \"x\"}\n{\"message_id\": 6, \"da").unwrap();

        let mut exporter = MessageExporter::open(&path).await.unwrap();
        assert!(exporter.contains(5));
        assert!(!exporter.contains(6));
        assert!(exporter.record(&text_message(6)).await.unwrap());
        drop(exporter);

        let contents = fs::read_to_string(&path).unwrap();
        let last = contents.lines().last().unwrap();
        let rec: ExportRecord = serde_json::from_str(last).unwrap();
        assert_eq!(rec.message_id, 6);
    }
}
