//! File storage boundary
//!
//! The mutation pipeline consumes file storage only for compensating cleanup:
//! when a mutation that already stored an upload fails at the database step,
//! the stored object is deleted again. Cleanup failures are logged, never
//! propagated - the mutation's own error is what the caller must see.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Deletion seam the services call through.
pub trait FileStore: Send + Sync {
    /// Delete a stored object.
    ///
    /// `is_rollback` marks compensating deletions so operators can tell
    /// cleanup traffic from user-initiated deletions in the logs.
    fn delete_file(&self, path: &str, is_rollback: bool) -> io::Result<()>;
}

/// Filesystem-backed store rooted at a directory.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a stored path under the root, rejecting traversal components.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing path outside upload root: {path:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl FileStore for LocalFileStore {
    fn delete_file(&self, path: &str, is_rollback: bool) -> io::Result<()> {
        let full = self.resolve(path)?;
        if is_rollback {
            log::info!("rollback cleanup: deleting {}", full.display());
        }
        std::fs::remove_file(full)
    }
}

/// Recording store for tests: remembers every deletion instead of touching
/// the filesystem.
#[derive(Default)]
pub struct RecordingFileStore {
    deleted: Mutex<Vec<(String, bool)>>,
}

impl RecordingFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(path, is_rollback)` pairs in deletion order.
    pub fn deletions(&self) -> Vec<(String, bool)> {
        self.deleted.lock().expect("recording store lock").clone()
    }
}

impl FileStore for RecordingFileStore {
    fn delete_file(&self, path: &str, is_rollback: bool) -> io::Result<()> {
        self.deleted
            .lock()
            .expect("recording store lock")
            .push((path.to_string(), is_rollback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_store_rejects_traversal() {
        let store = LocalFileStore::new("/tmp/rowguard-uploads");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("receipts/2026/r1.pdf").is_ok());
    }

    #[test]
    fn test_recording_store_captures_rollback_flag() {
        let store = RecordingFileStore::new();
        store.delete_file("a.pdf", true).unwrap();
        store.delete_file("b.pdf", false).unwrap();
        assert_eq!(
            store.deletions(),
            vec![("a.pdf".to_string(), true), ("b.pdf".to_string(), false)]
        );
    }
}
