//! Types for the state file and the archive ledger.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MediaKind, MessageId};

/// Resume point of an export. The only progress that survives a restart.
///
/// Every id up to and including `cursor` has been handled or deliberately
/// deferred into `retry_set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportState {
    #[serde(default)]
    pub cursor: MessageId,
    #[serde(default)]
    pub retry_set: BTreeSet<MessageId>,
}

/// Status of an item in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Downloaded,
    /// Transient failures exhausted the attempt budget; the id sits in the
    /// retry set for a later run.
    Deferred,
    /// Failed for good and will not be retried.
    Failed,
}

impl ItemStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Deferred => "deferred",
            Self::Failed => "failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "downloaded" => Some(Self::Downloaded),
            "deferred" => Some(Self::Deferred),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// What the ledger knows about one message's media.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub message_id: MessageId,
    pub file_name: String,
    pub local_path: Option<PathBuf>,
    /// Hex SHA-256 of the stored artifact.
    pub sha256: Option<String>,
    pub last_error: Option<String>,
    pub size_bytes: u64,
    pub message_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Attempts made across all runs.
    pub attempts: u32,
    pub kind: MediaKind,
    pub status: ItemStatus,
}

impl ItemRecord {
    pub fn downloaded(
        message_id: MessageId,
        kind: MediaKind,
        message_date: DateTime<Utc>,
        local_path: PathBuf,
        size_bytes: u64,
        sha256: String,
        attempts: u32,
    ) -> Self {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            message_id,
            file_name,
            local_path: Some(local_path),
            sha256: Some(sha256),
            last_error: None,
            size_bytes,
            message_date,
            updated_at: Utc::now(),
            attempts,
            kind,
            status: ItemStatus::Downloaded,
        }
    }

    pub fn failed(
        message_id: MessageId,
        kind: MediaKind,
        message_date: DateTime<Utc>,
        file_name: String,
        error: String,
        attempts: u32,
        deferred: bool,
    ) -> Self {
        Self {
            message_id,
            file_name,
            local_path: None,
            sha256: None,
            last_error: Some(error),
            size_bytes: 0,
            message_date,
            updated_at: Utc::now(),
            attempts,
            kind,
            status: if deferred {
                ItemStatus::Deferred
            } else {
                ItemStatus::Failed
            },
        }
    }
}

/// Statistics for a single export run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub scanned: u64,
    pub downloaded: u64,
    pub deferred: u64,
    pub failed: u64,
    pub skipped: u64,
    pub exported: u64,
    pub bytes: u64,
    pub interrupted: bool,
}

/// Summary of the ledger contents.
#[derive(Debug, Clone)]
pub struct LedgerSummary {
    pub total_items: u64,
    pub downloaded: u64,
    pub deferred: u64,
    pub failed: u64,
    pub total_bytes: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_status_round_trip() {
        for status in [ItemStatus::Downloaded, ItemStatus::Deferred, ItemStatus::Failed] {
            assert_eq!(ItemStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::from_str("pending"), None);
    }

    #[test]
    fn test_export_state_json_layout() {
        let state = ExportState {
            cursor: 42,
            retry_set: [9, 3].into_iter().collect(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"cursor":42,"retry_set":[3,9]}"#);
    }

    #[test]
    fn test_export_state_tolerates_missing_fields() {
        let state: ExportState = serde_json::from_str(r#"{"cursor": 5}"#).unwrap();
        assert_eq!(state.cursor, 5);
        assert!(state.retry_set.is_empty());
    }

    #[test]
    fn test_export_state_dedupes_retry_ids() {
        let state: ExportState =
            serde_json::from_str(r#"{"cursor": 5, "retry_set": [4, 2, 4]}"#).unwrap();
        assert_eq!(state.retry_set.len(), 2);
    }

    #[test]
    fn test_item_record_downloaded_takes_file_name() {
        let record = ItemRecord::downloaded(
            7,
            MediaKind::Photo,
            Utc::now(),
            PathBuf::from("/archive/photo/cat.jpg"),
            12,
            "ab".to_string(),
            3,
        );
        assert_eq!(record.file_name, "cat.jpg");
        assert_eq!(record.status, ItemStatus::Downloaded);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_item_record_failed_status() {
        let deferred = ItemRecord::failed(
            1,
            MediaKind::Video,
            Utc::now(),
            "v.mp4".into(),
            "timeout".into(),
            3,
            true,
        );
        assert_eq!(deferred.status, ItemStatus::Deferred);
        let failed = ItemRecord::failed(
            1,
            MediaKind::Video,
            Utc::now(),
            "v.mp4".into(),
            "forbidden".into(),
            1,
            false,
        );
        assert_eq!(failed.status, ItemStatus::Failed);
    }
}
