//! Durable storage for [`ExportState`].

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::fs_std::FileExt;

use super::error::StateError;
use super::types::ExportState;

/// Load/save contract for the export state.
///
/// `save` must be atomic with respect to a crash: afterwards either the old
/// or the new state is on disk, never a mix.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Zero state when nothing was saved yet.
    async fn load(&self) -> Result<ExportState, StateError>;

    async fn save(&self, state: &ExportState) -> Result<(), StateError>;
}

/// JSON file store: `{"cursor": N, "retry_set": [..]}`.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> StateError {
        StateError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<ExportState, StateError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No state file at {}, starting fresh", self.path.display());
                return Ok(ExportState::default());
            }
            Err(e) => return Err(self.corrupt(format!("unreadable: {e}"))),
        };

        let state: ExportState =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        if state.cursor < 0 {
            return Err(self.corrupt(format!("negative cursor {}", state.cursor)));
        }
        if let Some(bad) = state.retry_set.iter().find(|id| **id <= 0) {
            return Err(self.corrupt(format!("invalid message id {bad} in retry_set")));
        }
        Ok(state)
    }

    async fn save(&self, state: &ExportState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| self.corrupt(e.to_string()))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await?
    }
}

/// Write `<path>.tmp`, fsync, rename over `path`, then fsync the directory
/// so the rename itself survives a power cut.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| StateError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| StateError::io(&tmp, e))?;
        file.write_all(b"\n").map_err(|e| StateError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StateError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))?;

    #[cfg(unix)]
    {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Exclusive advisory lock on `<state file>.lock`, held for the lifetime of
/// the value.
#[derive(Debug)]
pub struct StateLock {
    _file: std::fs::File,
}

impl StateLock {
    pub async fn acquire(state_path: &Path) -> Result<Self, StateError> {
        let mut name = state_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        let lock_path = state_path.with_file_name(name);

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
            }
            let file =
                std::fs::File::create(&lock_path).map_err(|e| StateError::io(&lock_path, e))?;
            file.try_lock_exclusive().map_err(|_| StateError::Locked {
                path: lock_path.clone(),
            })?;
            Ok::<_, StateError>(Self { _file: file })
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("chat_export_store_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_file_is_zero_state() {
        let dir = test_dir("missing");
        let store = JsonStateStore::new(dir.join("export_state.json"));
        assert_eq!(store.load().await.unwrap(), ExportState::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = test_dir("round_trip");
        let store = JsonStateStore::new(dir.join("export_state.json"));
        let state = ExportState {
            cursor: 120,
            retry_set: [17, 45].into_iter().collect(),
        };
        store.save(&state).await.unwrap();

        assert_eq!(store.load().await.unwrap(), state);
        assert!(!dir.join("export_state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous() {
        let dir = test_dir("overwrite");
        let store = JsonStateStore::new(dir.join("s.json"));
        store
            .save(&ExportState {
                cursor: 1,
                retry_set: Default::default(),
            })
            .await
            .unwrap();
        store
            .save(&ExportState {
                cursor: 2,
                retry_set: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(store.load().await.unwrap().cursor, 2);
    }

    #[tokio::test]
    async fn test_save_creates_parent_dir() {
        let dir = test_dir("nested");
        let store = JsonStateStore::new(dir.join("a").join("b").join("s.json"));
        store.save(&ExportState::default()).await.unwrap();
        assert!(dir.join("a/b/s.json").exists());
    }

    #[tokio::test]
    async fn test_malformed_file_is_corrupt() {
        let dir = test_dir("malformed");
        let path = dir.join("s.json");
        fs::write(&path, b"{\"cursor\": ").unwrap();
        let err = JsonStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_negative_cursor_is_corrupt() {
        let dir = test_dir("negative");
        let path = dir.join("s.json");
        fs::write(&path, br#"{"cursor": -4, "retry_set": []}"#).unwrap();
        let err = JsonStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_operator_edited_file_loads() {
        let dir = test_dir("hand_edited");
        let path = dir.join("s.json");
        fs::write(&path, b"{\n  \"cursor\": 9,\n  \"retry_set\": [3]\n}\n").unwrap();
        let state = JsonStateStore::new(&path).load().await.unwrap();
        assert_eq!(state.cursor, 9);
        assert!(state.retry_set.contains(&3));
    }

    #[tokio::test]
    async fn test_second_lock_is_refused() {
        let dir = test_dir("lock");
        let state_path = dir.join("s.json");
        let first = StateLock::acquire(&state_path).await.unwrap();
        assert!(dir.join("s.json.lock").exists());

        let second = StateLock::acquire(&state_path).await;
        assert!(matches!(second, Err(StateError::Locked { .. })));

        drop(first);
        assert!(StateLock::acquire(&state_path).await.is_ok());
    }
}
