//! Filesystem areas the service reads from and cleans up.
//!
//! One area is rooted at the public directory (static assets), one at the
//! storage directory (rendered PDFs). All paths arriving from the outside are
//! resolved relative to the root and rejected when they try to escape it.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;

/// Errors that can occur while interacting with a storage area.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid stored path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Filesystem-backed read/delete access rooted at a single directory.
#[derive(Debug)]
pub struct StorageArea {
    root: PathBuf,
}

impl StorageArea {
    /// Initialise an area rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a stored file into memory.
    pub async fn read(&self, stored_path: &str) -> Result<Bytes, StorageError> {
        let absolute = self.resolve(stored_path)?;
        let data = fs::read(absolute).await?;
        Ok(Bytes::from(data))
    }

    /// Remove a stored file. Missing files are treated as success.
    pub async fn delete(&self, stored_path: &str) -> Result<(), StorageError> {
        let absolute = self.resolve(stored_path)?;
        match fs::remove_file(&absolute).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Resolve the absolute filesystem path for a stored file.
    fn resolve(&self, stored_path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(stored_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StorageError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_stored_file() {
        let dir = TempDir::new().expect("temp dir");
        let area = StorageArea::new(dir.path().to_path_buf()).expect("area");
        std::fs::write(dir.path().join("rendered-abc.pdf"), b"%PDF").expect("write");

        let bytes = area.read("rendered-abc.pdf").await.expect("read");
        assert_eq!(&bytes[..], b"%PDF");
    }

    #[tokio::test]
    async fn rejects_traversal_paths() {
        let dir = TempDir::new().expect("temp dir");
        let area = StorageArea::new(dir.path().to_path_buf()).expect("area");

        assert!(matches!(
            area.read("../escape.pdf").await,
            Err(StorageError::InvalidPath)
        ));
        assert!(matches!(
            area.read("/etc/passwd").await,
            Err(StorageError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_files() {
        let dir = TempDir::new().expect("temp dir");
        let area = StorageArea::new(dir.path().to_path_buf()).expect("area");

        area.delete("never-existed.pdf").await.expect("no-op");
    }

    #[tokio::test]
    async fn delete_removes_existing_file() {
        let dir = TempDir::new().expect("temp dir");
        let area = StorageArea::new(dir.path().to_path_buf()).expect("area");
        let path = dir.path().join("rendered-abc.pdf");
        std::fs::write(&path, b"%PDF").expect("write");

        area.delete("rendered-abc.pdf").await.expect("deleted");
        assert!(!path.exists());
    }
}
