//! JSON file blob store

use super::BlobStore;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name used inside a state directory
pub const SNAPSHOT_FILE: &str = "cache-snapshot.json";

/// Stores the blob in a single file, replaced atomically on save
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store inside `dir` under the default file name
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SNAPSHOT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl BlobStore for FileBlobStore {
    fn load_blob(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read cache snapshot: {}", self.path.display()))?;
        Ok(Some(content))
    }

    fn save_blob(&self, blob: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        // Write then rename so readers never see a partial snapshot
        let temp = self.temp_path();
        std::fs::write(&temp, blob)
            .with_context(|| format!("Failed to write cache snapshot: {}", temp.display()))?;
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to replace cache snapshot: {}", self.path.display()))?;

        debug!(path = %self.path.display(), bytes = blob.len(), "Snapshot file written");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove cache snapshot: {}", self.path.display()))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::in_dir(dir.path());
        assert!(store.load_blob().unwrap().is_none());
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::in_dir(&dir.path().join("nested"));

        store.save_blob(r#"{"version":1}"#).unwrap();
        assert_eq!(store.load_blob().unwrap().as_deref(), Some(r#"{"version":1}"#));
        assert!(!store.temp_path().exists());

        store.save_blob("second").unwrap();
        assert_eq!(store.load_blob().unwrap().as_deref(), Some("second"));

        store.clear().unwrap();
        assert!(!store.path().exists());
        // Clearing twice is fine
        store.clear().unwrap();
    }
}
