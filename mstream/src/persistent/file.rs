use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs;

use super::{Error, Storage};

/// File backed token slot.
///
/// Writes go to a sibling temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous token intact.
pub struct FileStorage {
    path: PathBuf,
    tmp_path: PathBuf,
    closed: AtomicBool,
}

impl FileStorage {
    /// Create a file storage at `path`, creating missing parent directories.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");
        Ok(Self {
            path,
            tmp_path: tmp_path.into(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write(&self, value: &str) -> Result<(), Error> {
        self.ensure_open()?;
        fs::write(&self.tmp_path, value).await?;
        fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }

    async fn read(&self) -> Result<String, Error> {
        self.ensure_open()?;
        match fs::read_to_string(&self.path).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), Error> {
        self.ensure_open()?;
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_before_write_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("token")).await.unwrap();
        assert_eq!(storage.read().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_write_replaces_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("token")).await.unwrap();

        storage.write("a-much-longer-first-token").await.unwrap();
        storage.write("t2").await.unwrap();

        assert_eq!(storage.read().await.unwrap(), "t2");
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/token");
        let storage = FileStorage::new(&path).await.unwrap();

        storage.write("t1").await.unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("token")).await.unwrap();

        storage.clear().await.unwrap();
        storage.write("t1").await.unwrap();
        storage.clear().await.unwrap();
        storage.clear().await.unwrap();

        assert_eq!(storage.read().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_value_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        {
            let storage = FileStorage::new(&path).await.unwrap();
            storage.write("t9").await.unwrap();
            storage.close().await.unwrap();
        }
        let storage = FileStorage::new(&path).await.unwrap();
        assert_eq!(storage.read().await.unwrap(), "t9");
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("token")).await.unwrap();
        storage.close().await.unwrap();

        assert!(matches!(storage.write("t1").await, Err(Error::Closed)));
        assert!(matches!(storage.read().await, Err(Error::Closed)));
    }
}
