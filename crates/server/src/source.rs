//! Sources an import job reads files from.
//!
//! A job walks a [`ScanSource`]: entries are discovered lazily so progress can
//! report a growing total while enumeration is still running, and each entry
//! is opened only when it is about to be ingested.

use crate::error::{IngestError, IngestResult};
use crate::ingest::ContentStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use keepsake_core::{ItemError, MediaKind, SessionId, SessionState, UploadSession};
use keepsake_metadata::MetadataStore;
use keepsake_metadata::models::{UploadPartRow, to_u64};
use keepsake_metadata::repos::SessionRepo;
use keepsake_storage::ObjectStore;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Read size when streaming local files.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One file discovered by a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEntry {
    /// Path relative to the source root, used in error reports.
    pub path: String,
    pub size_bytes: u64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Entries of a source. An `Err` item is a file that could not even be
/// listed; enumeration continues past it.
pub type EntryStream = Pin<Box<dyn Stream<Item = Result<ScanEntry, ItemError>> + Send>>;

/// Something an import job can enumerate and read.
#[async_trait]
pub trait ScanSource: Send + Sync {
    fn entries(&self) -> EntryStream;

    /// Open an entry for reading.
    async fn open(&self, entry: &ScanEntry) -> std::io::Result<ContentStream>;
}

/// Turns a directory scan reference into a readable source.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source_ref: &str) -> IngestResult<Arc<dyn ScanSource>>;
}

fn entry_for(path: String, size_bytes: u64, filename: Option<String>) -> ScanEntry {
    let content_type = filename
        .as_deref()
        .and_then(MediaKind::guess_content_type)
        .map(str::to_string);
    ScanEntry {
        path,
        size_bytes,
        filename,
        content_type,
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Stream a local file in fixed-size chunks.
fn read_file(path: PathBuf) -> ContentStream {
    Box::pin(async_stream::try_stream! {
        let mut file = tokio::fs::File::open(&path).await?;
        loop {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            yield Bytes::from(buf);
        }
    })
}

// =============================================================================
// Local directories
// =============================================================================

/// Every regular file below a directory, depth first in name order.
///
/// Hidden entries and symlinks are skipped.
pub struct FsDirectorySource {
    root: PathBuf,
}

impl FsDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[async_trait]
impl ScanSource for FsDirectorySource {
    fn entries(&self) -> EntryStream {
        let root = self.root.clone();
        Box::pin(async_stream::stream! {
            let mut pending = vec![root.clone()];
            while let Some(dir) = pending.pop() {
                let mut reader = match tokio::fs::read_dir(&dir).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        yield Err(ItemError::new(relative(&root, &dir), "unreadable", e.to_string()));
                        continue;
                    }
                };

                let mut children = Vec::new();
                loop {
                    match reader.next_entry().await {
                        Ok(Some(child)) => children.push(child),
                        Ok(None) => break,
                        Err(e) => {
                            yield Err(ItemError::new(relative(&root, &dir), "unreadable", e.to_string()));
                            break;
                        }
                    }
                }
                children.sort_by_key(|child| child.file_name());

                let mut subdirs = Vec::new();
                for child in children {
                    let name = child.file_name().to_string_lossy().into_owned();
                    if is_hidden(&name) {
                        continue;
                    }
                    let path = child.path();
                    let file_type = match child.file_type().await {
                        Ok(file_type) => file_type,
                        Err(e) => {
                            yield Err(ItemError::new(relative(&root, &path), "unreadable", e.to_string()));
                            continue;
                        }
                    };
                    if file_type.is_symlink() {
                        continue;
                    }
                    if file_type.is_dir() {
                        subdirs.push(path);
                        continue;
                    }
                    if !file_type.is_file() {
                        continue;
                    }
                    match child.metadata().await {
                        Ok(meta) => {
                            yield Ok(entry_for(relative(&root, &path), meta.len(), Some(name)));
                        }
                        Err(e) => {
                            yield Err(ItemError::new(relative(&root, &path), "unreadable", e.to_string()));
                        }
                    }
                }
                // Stack order: push in reverse so the first name is visited first.
                pending.extend(subdirs.into_iter().rev());
            }
        })
    }

    async fn open(&self, entry: &ScanEntry) -> std::io::Result<ContentStream> {
        let path = self.root.join(&entry.path);
        let meta = tokio::fs::symlink_metadata(&path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", entry.path),
            ));
        }
        Ok(read_file(path))
    }
}

/// Resolves scan roots on the local filesystem.
///
/// With a configured scan root, only directories below it are accepted.
pub struct FsSourceResolver {
    scan_root: Option<PathBuf>,
}

impl FsSourceResolver {
    pub fn new(scan_root: Option<PathBuf>) -> Self {
        Self { scan_root }
    }
}

#[async_trait]
impl SourceResolver for FsSourceResolver {
    async fn resolve(&self, source_ref: &str) -> IngestResult<Arc<dyn ScanSource>> {
        let root = tokio::fs::canonicalize(source_ref).await.map_err(|e| {
            IngestError::ValidationError(format!("scan root {source_ref} not accessible: {e}"))
        })?;
        let meta = tokio::fs::metadata(&root).await.map_err(|e| {
            IngestError::ValidationError(format!("scan root {source_ref} not accessible: {e}"))
        })?;
        if !meta.is_dir() {
            return Err(IngestError::ValidationError(format!(
                "scan root {source_ref} is not a directory"
            )));
        }

        if let Some(allowed) = &self.scan_root {
            let allowed = tokio::fs::canonicalize(allowed).await.map_err(|e| {
                IngestError::Internal(format!(
                    "configured scan root {} not accessible: {e}",
                    allowed.display()
                ))
            })?;
            if !root.starts_with(&allowed) {
                return Err(IngestError::ValidationError(format!(
                    "scan root {source_ref} is outside {}",
                    allowed.display()
                )));
            }
        }

        Ok(Arc::new(FsDirectorySource::new(root)))
    }
}

// =============================================================================
// Completed uploads
// =============================================================================

/// The single file assembled from a completed session's parts.
pub struct UploadPartsSource {
    storage: Arc<dyn ObjectStore>,
    entry: ScanEntry,
    parts: Vec<UploadPartRow>,
}

impl UploadPartsSource {
    /// Load the parts of a completed session.
    pub async fn load(
        storage: Arc<dyn ObjectStore>,
        metadata: &dyn MetadataStore,
        session_id: SessionId,
    ) -> IngestResult<Self> {
        let row = metadata
            .get_session(session_id.into_uuid())
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("upload session {session_id}")))?;
        let session = UploadSession::try_from(row)?;
        if session.state != SessionState::Completed {
            return Err(IngestError::SessionClosed {
                state: session.state.to_string(),
            });
        }
        let parts = metadata.list_parts(session_id.into_uuid()).await?;

        let mut entry = entry_for(
            session_id.to_string(),
            session.declared_size,
            session.metadata.filename.clone(),
        );
        if session.metadata.content_type.is_some() {
            entry.content_type = session.metadata.content_type.clone();
        }

        Ok(Self {
            storage,
            entry,
            parts,
        })
    }

    /// Parts must tile `0..declared_size` with no gaps.
    fn check_contiguous(&self) -> std::io::Result<()> {
        let mut expected = 0u64;
        for part in &self.parts {
            let offset = to_u64(part.offset_bytes, "offset_bytes").map_err(std::io::Error::other)?;
            let size = to_u64(part.size_bytes, "size_bytes").map_err(std::io::Error::other)?;
            if offset != expected {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("missing upload part at offset {expected}"),
                ));
            }
            expected = offset + size;
        }
        if expected != self.entry.size_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "upload parts cover {expected} of {} bytes",
                    self.entry.size_bytes
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ScanSource for UploadPartsSource {
    fn entries(&self) -> EntryStream {
        Box::pin(futures::stream::once(futures::future::ready(Ok(
            self.entry.clone()
        ))))
    }

    async fn open(&self, _entry: &ScanEntry) -> std::io::Result<ContentStream> {
        self.check_contiguous()?;
        let storage = self.storage.clone();
        let keys: Vec<String> = self.parts.iter().map(|p| p.object_key.clone()).collect();
        Ok(Box::pin(async_stream::try_stream! {
            for key in keys {
                let mut part = storage.get_stream(&key).await.map_err(std::io::Error::other)?;
                while let Some(chunk) = part.next().await {
                    yield chunk.map_err(std::io::Error::other)?;
                }
            }
        }))
    }
}
