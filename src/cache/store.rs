//! On-disk object store for depot content.
//!
//! The file system namespace is the index: a file at the resolved path is a
//! hit, anything else is a miss.  Objects are only ever published through
//! [`StagingFile::commit`], which writes into a uniquely named sibling file,
//! syncs it, and renames it over the final path.  Readers therefore see
//! either no object or a complete one.
//!
//! There is no cross-request locking.  Two concurrent populates for the same
//! path each stage their own file and the last rename wins.
//!
//! Creating, renaming and removing staging files are synchronous calls in
//! `tempfile`, so they run on the blocking pool.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("while creating cache directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("while creating temporary file in {}: {source}", .dir.display())]
    Stage { dir: PathBuf, source: io::Error },
    #[error("while writing temporary file: {0}")]
    Write(#[source] io::Error),
    #[error("while syncing temporary file: {0}")]
    Sync(#[source] io::Error),
    #[error("while renaming temporary file to {}: {source}", .path.display())]
    Rename { path: PathBuf, source: io::Error },
}

/// Run a synchronous filesystem call on the blocking pool.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// A cached object found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    pub path: PathBuf,
    pub size: u64,
}

/// Handle on the cache root directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location for a request path.
    pub fn resolve(&self, request_path: &str) -> PathBuf {
        path::resolve(&self.root, request_path)
    }

    /// Create the cache root if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        create_dir_all(&self.root).await
    }

    /// Look up the object at `path`.
    ///
    /// Returns `Ok(None)` for a missing path or anything that is not a
    /// regular file.
    pub async fn lookup(&self, path: &Path) -> io::Result<Option<CachedObject>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !meta.is_file() {
            return Ok(None);
        }
        Ok(Some(CachedObject {
            path: path.to_path_buf(),
            size: meta.len(),
        }))
    }

    /// Ensure the parent directory of `path` exists.  Safe to race.
    pub async fn prepare_parent(&self, path: &Path) -> Result<(), StoreError> {
        match path.parent() {
            Some(parent) => create_dir_all(parent).await,
            None => Ok(()),
        }
    }

    /// Create a staging file next to `path`.
    ///
    /// The parent directory must already exist (see
    /// [`prepare_parent`](Self::prepare_parent)).
    pub async fn stage(&self, path: &Path) -> Result<StagingFile, StoreError> {
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        let prefix = match path.file_name() {
            Some(name) => format!(".{}.", name.to_string_lossy()),
            None => ".".to_string(),
        };

        let staging_dir = dir.clone();
        let named = blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".tmp")
                .tempfile_in(&staging_dir)
        })
        .await
        .map_err(|source| StoreError::Stage { dir, source })?;
        let (file, temp_path) = named.into_parts();

        debug!(staging = %temp_path.display(), target = %path.display(), "created staging file");

        Ok(StagingFile {
            file: tokio::fs::File::from_std(file),
            temp_path,
            target: path.to_path_buf(),
            written: 0,
        })
    }
}

async fn create_dir_all(path: &Path) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| StoreError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

// ---------------------------------------------------------------------------
// StagingFile
// ---------------------------------------------------------------------------

/// An in-flight object that is not yet visible under its final name.
///
/// Dropping a `StagingFile` without committing it deletes it synchronously;
/// [`discard`](Self::discard) does the same off the async workers.
#[derive(Debug)]
pub struct StagingFile {
    file: tokio::fs::File,
    temp_path: TempPath,
    target: PathBuf,
    written: u64,
}

impl StagingFile {
    /// Current on-disk location of the staging file.
    pub fn path(&self) -> &Path {
        &self.temp_path
    }

    /// Final location the object is published to.
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.file.write_all(chunk).await.map_err(StoreError::Write)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Sync the contents to stable storage, then atomically publish them
    /// under the target path.  Returns the object size.
    pub async fn commit(self) -> Result<u64, StoreError> {
        let Self {
            mut file,
            temp_path,
            target,
            written,
        } = self;

        file.flush().await.map_err(StoreError::Write)?;
        file.sync_all().await.map_err(StoreError::Sync)?;
        drop(file);

        // On failure the returned `TempPath` is dropped inside the closure,
        // which removes the staging file.
        let dest = target.clone();
        blocking(move || temp_path.persist(&dest).map_err(|e| e.error))
            .await
            .map_err(|source| StoreError::Rename {
                path: target.clone(),
                source,
            })?;

        debug!(path = %target.display(), bytes = written, "cached object");
        Ok(written)
    }

    /// Remove the staging file.
    pub async fn discard(self) {
        let Self { file, temp_path, .. } = self;
        drop(file);
        if let Err(e) = blocking(move || temp_path.close()).await {
            debug!(error = %e, "failed to remove staging file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn lookup_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk/none");
        assert!(store.lookup(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_directory_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730");
        std::fs::create_dir_all(&path).unwrap();
        assert!(store.lookup(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_publishes_complete_object() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk/abc");
        store.prepare_parent(&path).await.unwrap();

        let mut staging = store.stage(&path).await.unwrap();
        assert_eq!(staging.path().parent(), path.parent());
        assert_eq!(staging.target(), path.as_path());
        staging.write_chunk(b"hello ").await.unwrap();
        staging.write_chunk(b"world").await.unwrap();
        assert_eq!(staging.bytes_written(), 11);

        // Not visible until commit.
        assert!(store.lookup(&path).await.unwrap().is_none());

        assert_eq!(staging.commit().await.unwrap(), 11);

        let object = store.lookup(&path).await.unwrap().unwrap();
        assert_eq!(object.size, 11);
        assert_eq!(object.path, path);
        assert_eq!(std::fs::read(&object.path).unwrap(), b"hello world");
        assert_eq!(entries(path.parent().unwrap()), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn dropped_staging_file_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk/abc");
        store.prepare_parent(&path).await.unwrap();

        let mut staging = store.stage(&path).await.unwrap();
        staging.write_chunk(b"partial").await.unwrap();
        let staged = staging.path().to_path_buf();
        assert!(staged.exists());
        drop(staging);

        assert!(!staged.exists());
        assert!(entries(path.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn discard_removes_staging_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/x");
        store.prepare_parent(&path).await.unwrap();

        let staging = store.stage(&path).await.unwrap();
        let staged = staging.path().to_path_buf();
        staging.discard().await;
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn concurrent_stages_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk/abc");
        store.prepare_parent(&path).await.unwrap();

        let mut first = store.stage(&path).await.unwrap();
        let mut second = store.stage(&path).await.unwrap();
        assert_ne!(first.path(), second.path());

        first.write_chunk(b"first").await.unwrap();
        second.write_chunk(b"second").await.unwrap();
        first.commit().await.unwrap();
        second.commit().await.unwrap();

        let object = store.lookup(&path).await.unwrap().unwrap();
        assert_eq!(object.size, 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn failed_rename_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk");
        store.prepare_parent(&path).await.unwrap();
        // A non-empty directory at the target makes the rename fail.
        std::fs::create_dir_all(path.join("inner")).unwrap();

        let mut staging = store.stage(&path).await.unwrap();
        staging.write_chunk(b"data").await.unwrap();
        let err = staging.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Rename { .. }));
        assert_eq!(entries(path.parent().unwrap()), vec!["chunk".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn staging_lifecycle_runs_on_single_worker_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk/abc");
        store.prepare_parent(&path).await.unwrap();

        let (a, b) = tokio::join!(store.stage(&path), store.stage(&path));
        let (mut a, b) = (a.unwrap(), b.unwrap());
        a.write_chunk(b"kept").await.unwrap();
        let discarded = b.path().to_path_buf();
        b.discard().await;
        assert_eq!(a.commit().await.unwrap(), 4);

        assert!(!discarded.exists());
        assert_eq!(entries(path.parent().unwrap()), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn prepare_parent_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        let path = store.resolve("/depot/730/chunk/abc");
        store.prepare_parent(&path).await.unwrap();
        store.prepare_parent(&path).await.unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn prepare_parent_fails_when_blocked_by_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::new(tmp.path());
        std::fs::write(tmp.path().join("depot"), b"not a directory").unwrap();
        let path = store.resolve("/depot/730/chunk/abc");
        let err = store.prepare_parent(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::CreateDir { .. }));
    }
}
