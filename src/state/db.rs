//! Archive ledger trait and SQLite implementation.
//!
//! The ledger records what each run stored where, for `status` and
//! `verify`. Resuming never consults it; the state file alone decides
//! where traversal continues.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{ItemRecord, ItemStatus, LedgerSummary, RunStats};
use crate::types::MediaKind;

/// Object-safe ledger interface, usable as `&dyn Ledger`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert or update the record for a message. Attempts accumulate across
    /// runs.
    async fn upsert_item(&self, record: &ItemRecord) -> Result<(), StateError>;

    /// Items that did not make it to disk, deferred and failed, by id.
    async fn get_failed(&self) -> Result<Vec<ItemRecord>, StateError>;

    async fn get_all_downloaded(&self) -> Result<Vec<ItemRecord>, StateError>;

    async fn get_summary(&self) -> Result<LedgerSummary, StateError>;

    /// Start a new export run and return its ID.
    async fn start_run(&self) -> Result<i64, StateError>;

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError>;
}

const ITEM_COLUMNS: &str = "message_id, kind, file_name, local_path, size_bytes, sha256, status, attempts, last_error, message_date, updated_at";

pub struct SqliteLedger {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open or create a ledger at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            // Safe with WAL; the state file is the durable record anyway.
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    #[cfg(test)]
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_items(&self, where_clause: &str) -> Result<Vec<ItemRecord>, StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE {where_clause} ORDER BY message_id"
            ))
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([], |row| Ok(row_to_item_record(row)))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn upsert_item(&self, record: &ItemRecord) -> Result<(), StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO items (message_id, kind, file_name, local_path, size_bytes, sha256, status, attempts, last_error, message_date, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(message_id) DO UPDATE SET
                kind = excluded.kind,
                file_name = excluded.file_name,
                local_path = excluded.local_path,
                size_bytes = excluded.size_bytes,
                sha256 = excluded.sha256,
                status = excluded.status,
                attempts = items.attempts + excluded.attempts,
                last_error = excluded.last_error,
                message_date = excluded.message_date,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                record.message_id,
                record.kind.as_str(),
                &record.file_name,
                record
                    .local_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                record.size_bytes as i64,
                &record.sha256,
                record.status.as_str(),
                record.attempts as i64,
                &record.last_error,
                record.message_date.timestamp(),
                record.updated_at.timestamp(),
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn get_failed(&self) -> Result<Vec<ItemRecord>, StateError> {
        self.query_items("status IN ('failed', 'deferred')")
    }

    async fn get_all_downloaded(&self) -> Result<Vec<ItemRecord>, StateError> {
        self.query_items("status = 'downloaded'")
    }

    async fn get_summary(&self) -> Result<LedgerSummary, StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        let count_status = |status: ItemStatus| -> Result<u64, StateError> {
            conn.query_row(
                "SELECT COUNT(*) FROM items WHERE status = ?1",
                [status.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(StateError::query)
        };
        let downloaded = count_status(ItemStatus::Downloaded)?;
        let deferred = count_status(ItemStatus::Deferred)?;
        let failed = count_status(ItemStatus::Failed)?;

        let (total_items, total_bytes): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'downloaded' THEN size_bytes ELSE 0 END), 0) FROM items",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StateError::query)?;

        let last_run: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM export_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_run_started, last_run_completed) = match last_run {
            Some((started, completed)) => (
                started.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            ),
            None => (None, None),
        };

        Ok(LedgerSummary {
            total_items: total_items as u64,
            downloaded,
            deferred,
            failed,
            total_bytes: total_bytes as u64,
            last_run_started,
            last_run_completed,
        })
    }

    async fn start_run(&self) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();

        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        conn.execute(
            "INSERT INTO export_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();

        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        conn.execute(
            "UPDATE export_runs SET completed_at = ?1, scanned = ?2, downloaded = ?3, deferred = ?4, failed = ?5, skipped = ?6, exported = ?7, bytes = ?8, interrupted = ?9 WHERE id = ?10",
            rusqlite::params![
                completed_at,
                stats.scanned as i64,
                stats.downloaded as i64,
                stats.deferred as i64,
                stats.failed as i64,
                stats.skipped as i64,
                stats.exported as i64,
                stats.bytes as i64,
                stats.interrupted as i64,
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }
}

fn row_to_item_record(row: &rusqlite::Row<'_>) -> ItemRecord {
    let message_id: i64 = row.get(0).unwrap_or_default();
    let kind_str: String = row.get(1).unwrap_or_default();
    let file_name: String = row.get(2).unwrap_or_default();
    let local_path_str: Option<String> = row.get(3).ok().flatten();
    let size_bytes: i64 = row.get(4).unwrap_or(0);
    let sha256: Option<String> = row.get(5).ok().flatten();
    let status_str: String = row.get(6).unwrap_or_default();
    let attempts: i64 = row.get(7).unwrap_or(0);
    let last_error: Option<String> = row.get(8).ok().flatten();
    let message_date_ts: i64 = row.get(9).unwrap_or(0);
    let updated_at_ts: i64 = row.get(10).unwrap_or(0);

    ItemRecord {
        message_id,
        file_name,
        local_path: local_path_str.map(PathBuf::from),
        sha256,
        last_error,
        size_bytes: size_bytes as u64,
        message_date: Utc
            .timestamp_opt(message_date_ts, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        updated_at: Utc
            .timestamp_opt(updated_at_ts, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        attempts: attempts as u32,
        kind: MediaKind::from_str(&kind_str).unwrap_or(MediaKind::Document),
        status: ItemStatus::from_str(&status_str).unwrap_or(ItemStatus::Failed),
    }
}
