use super::BlobStore;
use anyhow::Result;
use parking_lot::Mutex;

/// In-process blob store, for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryBlobStore {
    blob: Mutex<Option<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: String) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
        }
    }

    /// Currently stored blob
    pub fn contents(&self) -> Option<String> {
        self.blob.lock().clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load_blob(&self) -> Result<Option<String>> {
        Ok(self.contents())
    }

    fn save_blob(&self, blob: &str) -> Result<()> {
        *self.blob.lock() = Some(blob.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.blob.lock() = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
