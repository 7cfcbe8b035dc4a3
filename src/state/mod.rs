//! Persistent export state.
//!
//! Two stores live next to each other:
//! - the JSON state file (cursor and retry set), the only thing resuming
//!   depends on, written atomically after every unit of progress
//! - the SQLite ledger, an informational record of stored artifacts and
//!   runs used by `status` and `verify`

pub mod db;
pub mod error;
pub mod schema;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};

pub use db::{Ledger, SqliteLedger};
pub use error::StateError;
pub use store::{JsonStateStore, StateLock, StateStore};
pub use types::{ExportState, ItemRecord, ItemStatus, RunStats};

/// Ledger database path for a state file: same directory and stem, `.db`.
pub fn ledger_path(state_file: &Path) -> PathBuf {
    state_file.with_extension("db")
}
