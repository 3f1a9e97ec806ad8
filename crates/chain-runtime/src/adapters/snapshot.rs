//! Cache snapshot persisted as a JSON file.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::{CacheSnapshot, RuntimeError, RuntimeResult};
use crate::ports::SnapshotStore;

/// Writes the snapshot to a sibling temp file and renames it into place,
/// so a crash mid-write leaves the previous snapshot intact.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, e: std::io::Error) -> RuntimeError {
        RuntimeError::Persistence(format!("{}: {e}", self.path.display()))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> RuntimeResult<Option<CacheSnapshot>> {
        let source = match tokio::fs::read_to_string(&self.path).await {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let snapshot = serde_json::from_str(&source).map_err(|e| {
            RuntimeError::Persistence(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> RuntimeResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, body)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), entries = snapshot.entries.len(), "cache snapshot saved");
        Ok(())
    }
}
