pub mod cache;
pub mod cleanup;
pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::error::StorageError;
use crate::observability::metrics as obs;
use crate::package::manifest::MASTER_PLAYLIST;

pub use local::LocalStore;
pub use memory::InMemoryStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

// ---------------------------------------------------------------------------
// ContentStore capability
// ---------------------------------------------------------------------------

/// Capability set shared by every storage backend.
///
/// Names are `/`-separated object names relative to the backend root (a base
/// directory or a bucket). Every read returns the object's metadata together
/// with the stream, so response headers never depend on the stream itself.
pub trait ContentStore: Send + Sync {
    /// Metadata only; never transfers body bytes.
    fn stat(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<ObjectMetadata, StorageError>> + Send;

    /// Open the inclusive byte range `start..=end`. The returned body yields
    /// exactly `end - start + 1` bytes.
    fn open_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> impl std::future::Future<Output = Result<ObjectBody, StorageError>> + Send;

    /// Open the whole object.
    fn open_full(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<ObjectBody, StorageError>> + Send;

    /// Write or overwrite an object. Returns the new etag.
    fn put(
        &self,
        name: &str,
        data: Bytes,
        content_type: &str,
    ) -> impl std::future::Future<Output = Result<String, StorageError>> + Send;

    /// List objects whose name starts with `prefix`, sorted by name.
    fn list(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ObjectMetadata>, StorageError>> + Send;

    /// Delete every object under `prefix`. Returns the number deleted.
    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<u64, StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// Storage types
// ---------------------------------------------------------------------------

/// Backend-agnostic snapshot of one object, taken at call time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    pub name: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

/// Boxed async byte source handed to the HTTP layer.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// An opened object: metadata of the whole object plus a reader over the
/// requested bytes.
pub struct ObjectBody {
    pub metadata: ObjectMetadata,
    /// Bytes the reader will yield (the range length, or the full size).
    pub length: u64,
    pub reader: BodyReader,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("metadata", &self.metadata)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl ObjectBody {
    /// Buffer the whole body, refusing anything larger than `max_bytes`.
    pub async fn read_to_bytes(self, max_bytes: u64) -> Result<Bytes, StorageError> {
        if self.length > max_bytes {
            return Err(StorageError::InvalidInput {
                reason: format!(
                    "{} is {} bytes, above the {} byte read limit",
                    self.metadata.name, self.length, max_bytes
                ),
            });
        }
        let mut buf = Vec::with_capacity(self.length as usize);
        let mut reader = self.reader.take(max_bytes);
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

// ---------------------------------------------------------------------------
// Content type helpers
// ---------------------------------------------------------------------------

/// Determine content type from file extension.
pub fn content_type_for_path(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "mp4" | "m4v" => "video/mp4",
        "m4s" => "video/iso.segment",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// A configured backend. Enum dispatch keeps the capability trait free of
/// boxing while letting configuration pick the implementation.
pub enum StoreBackend {
    Local(LocalStore),
    Memory(InMemoryStore),
    #[cfg(feature = "s3")]
    S3(S3Store),
}

impl StoreBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Local(_) => "local",
            StoreBackend::Memory(_) => "memory",
            #[cfg(feature = "s3")]
            StoreBackend::S3(_) => "s3",
        }
    }

    /// Filesystem path of an object, for backends that have one. Lets the
    /// encoder read a local source without copying it.
    pub fn local_path(&self, name: &str) -> Result<Option<PathBuf>, StorageError> {
        match self {
            StoreBackend::Local(store) => store.resolve(name).map(Some),
            _ => Ok(None),
        }
    }

    /// Move a finished staging tree into place as `<stream_name>/`.
    /// Returns the number of objects published.
    pub async fn publish(&self, staging: &Path, stream_name: &str) -> Result<u64, StorageError> {
        match self {
            StoreBackend::Local(store) => store.publish_dir(staging, stream_name).await,
            StoreBackend::Memory(store) => upload_tree(store, staging, stream_name).await,
            #[cfg(feature = "s3")]
            StoreBackend::S3(store) => upload_tree(store, staging, stream_name).await,
        }
    }

    /// Time-limited GET URL for an object (object-store backends only).
    pub async fn presign_get(&self, name: &str, expires: Duration) -> Result<String, StorageError> {
        match self {
            #[cfg(feature = "s3")]
            StoreBackend::S3(store) => store.presign_get(name, expires).await,
            _ => {
                let _ = (name, expires);
                Err(StorageError::Unsupported {
                    backend: self.kind(),
                    operation: "presign",
                })
            }
        }
    }
}

impl ContentStore for StoreBackend {
    async fn stat(&self, name: &str) -> Result<ObjectMetadata, StorageError> {
        let op = async {
            match self {
                StoreBackend::Local(s) => s.stat(name).await,
                StoreBackend::Memory(s) => s.stat(name).await,
                #[cfg(feature = "s3")]
                StoreBackend::S3(s) => s.stat(name).await,
            }
        };
        observed(self.kind(), "stat", op).await
    }

    async fn open_range(&self, name: &str, start: u64, end: u64) -> Result<ObjectBody, StorageError> {
        let op = async {
            match self {
                StoreBackend::Local(s) => s.open_range(name, start, end).await,
                StoreBackend::Memory(s) => s.open_range(name, start, end).await,
                #[cfg(feature = "s3")]
                StoreBackend::S3(s) => s.open_range(name, start, end).await,
            }
        };
        observed(self.kind(), "open_range", op).await
    }

    async fn open_full(&self, name: &str) -> Result<ObjectBody, StorageError> {
        let op = async {
            match self {
                StoreBackend::Local(s) => s.open_full(name).await,
                StoreBackend::Memory(s) => s.open_full(name).await,
                #[cfg(feature = "s3")]
                StoreBackend::S3(s) => s.open_full(name).await,
            }
        };
        observed(self.kind(), "open_full", op).await
    }

    async fn put(&self, name: &str, data: Bytes, content_type: &str) -> Result<String, StorageError> {
        let op = async {
            match self {
                StoreBackend::Local(s) => s.put(name, data, content_type).await,
                StoreBackend::Memory(s) => s.put(name, data, content_type).await,
                #[cfg(feature = "s3")]
                StoreBackend::S3(s) => s.put(name, data, content_type).await,
            }
        };
        observed(self.kind(), "put", op).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        let op = async {
            match self {
                StoreBackend::Local(s) => s.list(prefix).await,
                StoreBackend::Memory(s) => s.list(prefix).await,
                #[cfg(feature = "s3")]
                StoreBackend::S3(s) => s.list(prefix).await,
            }
        };
        observed(self.kind(), "list", op).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let op = async {
            match self {
                StoreBackend::Local(s) => s.delete_prefix(prefix).await,
                StoreBackend::Memory(s) => s.delete_prefix(prefix).await,
                #[cfg(feature = "s3")]
                StoreBackend::S3(s) => s.delete_prefix(prefix).await,
            }
        };
        observed(self.kind(), "delete_prefix", op).await
    }
}

/// Time one backend operation and count its failures. Not-found is an
/// answer, not a failure.
async fn observed<T>(
    backend: &'static str,
    operation: &'static str,
    op: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    let started = Instant::now();
    let result = op.await;
    obs::record_storage_operation(backend, operation, started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        if !e.is_not_found() {
            obs::inc_storage_error(backend, operation, e.kind());
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Tree upload
// ---------------------------------------------------------------------------

/// Upload every file under `dir` as `<stream_name>/<relative path>`.
///
/// The master playlist is uploaded last so that its presence implies every
/// rendition is already in place.
pub async fn upload_tree<S: ContentStore>(
    store: &S,
    dir: &Path,
    stream_name: &str,
) -> Result<u64, StorageError> {
    let mut files = collect_files(dir).await?;
    files.sort_by(|a, b| {
        let a_master = a.0 == MASTER_PLAYLIST;
        let b_master = b.0 == MASTER_PLAYLIST;
        a_master.cmp(&b_master).then_with(|| a.0.cmp(&b.0))
    });

    let mut uploaded = 0u64;
    for (relative, path) in files {
        let name = format!("{}/{}", stream_name, relative);
        let data = tokio::fs::read(&path).await?;
        store
            .put(&name, Bytes::from(data), content_type_for_path(&name))
            .await?;
        uploaded += 1;
    }
    Ok(uploaded)
}

/// Regular files under `dir` as (`/`-joined relative name, absolute path),
/// skipping hidden entries.
pub(crate) async fn collect_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];

    while let Some((current, relative)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            let child = if relative.is_empty() {
                file_name.to_string()
            } else {
                format!("{}/{}", relative, file_name)
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), child));
            } else if file_type.is_file() {
                files.push((child, entry.path()));
            }
        }
    }

    Ok(files)
}
