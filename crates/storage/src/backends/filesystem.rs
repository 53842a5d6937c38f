//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Read buffer size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Times a write recreates a parent directory pruned under it.
const PARENT_RETRIES: u32 = 3;

/// Local filesystem object store.
///
/// Keys map to relative paths below `root`. Writes land in a sibling temp
/// file, are fsynced, then renamed into place, so readers never see partial
/// objects.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating `root` if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, refusing anything that could leave the root.
    ///
    /// Canonicalization touches the filesystem, so it runs on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Create `path` for writing, recreating its parent if a concurrent prune
    /// removed it in between.
    async fn create_file(&self, path: &Path) -> std::io::Result<fs::File> {
        let mut attempt = 0;
        loop {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            match fs::File::create(path).await {
                Err(e) if e.kind() == ErrorKind::NotFound && attempt < PARENT_RETRIES => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Remove directories left empty by a delete, stopping at the root.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let suffix = format!(".tmp.{}", Uuid::new_v4());
    let name = path
        .file_name()
        .map(|n| format!("{}{suffix}", n.to_string_lossy()))
        .unwrap_or(suffix);
    path.with_file_name(name)
}

fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    let relative = Path::new(key);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }

    let root_canonical = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;
    let path = root.join(relative);

    // The deepest existing ancestor (or the path itself) must resolve inside
    // the root; this also catches symlinks whose targets are missing.
    let mut probe = Some(path.as_path());
    while let Some(candidate) = probe {
        match std::fs::symlink_metadata(candidate) {
            Ok(meta) => {
                let resolved = candidate.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !resolved.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => probe = candidate.parent(),
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    Ok(path)
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;

        let stream = async_stream::try_stream! {
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;

        let temp_path = temp_sibling(&path);
        let written = async {
            let mut file = self.create_file(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;

        let temp_path = temp_sibling(&path);
        let file = self.create_file(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        self.prune_empty_parents(&path).await;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base_path = self.key_path(prefix).await?;
        let mut results = Vec::new();

        match fs::try_exists(&base_path).await {
            Ok(true) => {}
            Ok(false) => return Ok(results),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; links are skipped entirely
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().contains(".tmp.")
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    results.push(rel.to_string_lossy().to_string());
                }
            }
        }

        results.sort();
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.key_path(from).await?;
        let to_path = self.key_path(to).await?;
        self.ensure_parent(&to_path).await?;

        let temp_path = temp_sibling(&to_path);
        if let Err(e) = fs::copy(&from_path, &temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(not_found_or_io(from, e));
        }
        fs::rename(&temp_path, &to_path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.key_path(from).await?;
        let to_path = self.key_path(to).await?;
        let mut attempt = 0;
        loop {
            self.ensure_parent(&to_path).await?;
            match fs::rename(&from_path, &to_path).await {
                Ok(()) => break,
                // The destination directory may have been pruned under us
                Err(e)
                    if e.kind() == ErrorKind::NotFound
                        && attempt < PARENT_RETRIES
                        && fs::try_exists(&from_path).await.unwrap_or(false) =>
                {
                    attempt += 1;
                }
                Err(e) => return Err(not_found_or_io(from, e)),
            }
        }
        self.prune_empty_parents(&from_path).await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let this = *self;
        if let Err(e) = this.file.sync_all().await {
            let _ = fs::remove_file(&this.temp_path).await;
            return Err(StorageError::Io(e));
        }
        drop(this.file);
        fs::rename(&this.temp_path, &this.final_path).await?;
        Ok(this.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let this = *self;
        drop(this.file);
        let _ = fs::remove_file(&this.temp_path).await;
        Ok(())
    }
}
