//! Error types for the state file and the archive ledger.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    /// The state file exists but cannot be trusted. Never recovered from
    /// silently; the operator has to repair or reset it.
    #[error("State file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Another export is already using {path}")]
    Locked { path: PathBuf },

    /// Failed to open or create the ledger database.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
