//! Named-blob persistence used for policy records and marker files.

use async_trait::async_trait;
use dirsearch_core::error::Error;
use dirsearch_core::Result;
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// A flat namespace of byte blobs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads a blob; `None` if it does not exist.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Creates or replaces a blob.
    async fn write(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Copies a blob, replacing the destination.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Renames a blob, replacing the destination.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Removes a blob. Removing a missing blob succeeds.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Returns true if the blob exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Lists blob names, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidRequest(format!("invalid blob name `{name}`")));
    }
    Ok(())
}

/// Blobs stored as files in one directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the blobs.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(name)?).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        // write-then-rename so readers never see a partial blob
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::copy(self.path(from)?, self.path(to)?).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(self.path(from)?, self.path(to)?).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(name)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(name)?).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Blobs held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of a blob.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .ok()
            .and_then(|blobs| blobs.get(name).cloned())
    }

    fn with_blobs<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> Result<T>) -> Result<T> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| Error::InternalError("blob store lock poisoned".to_string()))?;
        f(&mut blobs)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::IoError("blob store is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        check_name(name)?;
        self.with_blobs(|blobs| Ok(blobs.get(name).cloned()))
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        check_name(name)?;
        self.check_writable()?;
        self.with_blobs(|blobs| {
            blobs.insert(name.to_string(), data.to_vec());
            Ok(())
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        check_name(from)?;
        check_name(to)?;
        self.check_writable()?;
        self.with_blobs(|blobs| {
            let data = blobs
                .get(from)
                .cloned()
                .ok_or_else(|| Error::IoError(format!("blob `{from}` not found")))?;
            blobs.insert(to.to_string(), data);
            Ok(())
        })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        check_name(from)?;
        check_name(to)?;
        self.check_writable()?;
        self.with_blobs(|blobs| {
            let data = blobs
                .remove(from)
                .ok_or_else(|| Error::IoError(format!("blob `{from}` not found")))?;
            blobs.insert(to.to_string(), data);
            Ok(())
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.check_writable()?;
        self.with_blobs(|blobs| {
            blobs.remove(name);
            Ok(())
        })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        self.with_blobs(|blobs| Ok(blobs.contains_key(name)))
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.with_blobs(|blobs| Ok(blobs.keys().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn BlobStore) {
        assert_eq!(store.read("a.json").await.unwrap(), None);
        assert!(!store.exists("a.json").await.unwrap());

        store.write("a.json", b"one").await.unwrap();
        assert_eq!(store.read("a.json").await.unwrap(), Some(b"one".to_vec()));

        store.copy("a.json", "a.json.bak").await.unwrap();
        store.write("a.json", b"two").await.unwrap();
        assert_eq!(
            store.read("a.json.bak").await.unwrap(),
            Some(b"one".to_vec())
        );

        store.rename("a.json", "a.json.corrupt").await.unwrap();
        assert!(!store.exists("a.json").await.unwrap());
        assert_eq!(
            store.list().await.unwrap(),
            vec!["a.json.bak".to_string(), "a.json.corrupt".to_string()]
        );

        store.remove("a.json.bak").await.unwrap();
        store.remove("a.json.bak").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a.json.corrupt".to_string()]);
    }

    #[tokio::test]
    async fn memory_store_operations() {
        exercise(&MemoryBlobStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_operations() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsBlobStore::new(dir.path().join("policy"))).await;
    }

    #[tokio::test]
    async fn fs_store_missing_dir_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.dir(), dir.path().join("absent"));
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.write("../escape", b"x").await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            FsBlobStore::new("/tmp").read("a/b").await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn failing_writes() {
        let store = MemoryBlobStore::new();
        store.write("a", b"1").await.unwrap();
        store.set_fail_writes(true);
        assert!(matches!(store.write("a", b"2").await, Err(Error::IoError(_))));
        assert_eq!(store.get("a"), Some(b"1".to_vec()));
    }
}
