use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::StorageError;
use crate::core::security::{validate_object_name, validate_prefix};

use super::{collect_files, content_type_for_path, upload_tree, ContentStore, ObjectBody, ObjectMetadata};

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

/// Filesystem backend rooted at a single base directory.
///
/// Every name is validated before touching the filesystem, so no name can
/// resolve outside `root`. Hidden entries (such as in-flight temp files) are
/// never listed.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Map an object name to its path under the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_object_name(name).map_err(|reason| StorageError::InvalidName {
            name: name.to_string(),
            reason,
        })?;
        Ok(name.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }

    /// Move a staging directory into place as `<stream_name>/`. Falls back to
    /// copying when a rename is not possible (e.g. across filesystems).
    pub async fn publish_dir(&self, staging: &Path, stream_name: &str) -> Result<u64, StorageError> {
        let dest = self.resolve(stream_name)?;
        if tokio::fs::try_exists(&dest).await? {
            return Err(StorageError::AlreadyExists {
                name: stream_name.to_string(),
            });
        }
        self.ensure_root().await?;

        let count = collect_files(staging).await?.len() as u64;
        match tokio::fs::rename(staging, &dest).await {
            Ok(()) => {
                debug!(stream = %stream_name, dest = %dest.display(), "published by rename");
                Ok(count)
            }
            Err(e) => {
                warn!(
                    stream = %stream_name,
                    error = %e,
                    "rename into place failed, copying staging tree instead"
                );
                let copied = upload_tree(self, staging, stream_name).await?;
                tokio::fs::remove_dir_all(staging).await?;
                Ok(copied)
            }
        }
    }

    async fn open_file(&self, name: &str) -> Result<(File, ObjectMetadata), StorageError> {
        let path = self.resolve(name)?;
        let file = File::open(&path)
            .await
            .map_err(|e| map_io_error(name, e))?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(StorageError::NotFound {
                name: name.to_string(),
            });
        }
        Ok((file, object_metadata(name, &meta)))
    }
}

fn map_io_error(name: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound {
            name: name.to_string(),
        },
        // A path component that is a regular file.
        std::io::ErrorKind::NotADirectory => StorageError::NotFound {
            name: name.to_string(),
        },
        _ => StorageError::Io(err),
    }
}

fn object_metadata(name: &str, meta: &std::fs::Metadata) -> ObjectMetadata {
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    let mtime_secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ObjectMetadata {
        name: name.to_string(),
        size_bytes: meta.len(),
        content_type: content_type_for_path(name).to_string(),
        last_modified: DateTime::<Utc>::from(modified),
        etag: format!("\"{:x}-{:x}\"", meta.len(), mtime_secs),
    }
}

impl ContentStore for LocalStore {
    async fn stat(&self, name: &str) -> Result<ObjectMetadata, StorageError> {
        let path = self.resolve(name)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_io_error(name, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(object_metadata(name, &meta))
    }

    async fn open_range(&self, name: &str, start: u64, end: u64) -> Result<ObjectBody, StorageError> {
        let (mut file, metadata) = self.open_file(name).await?;
        if start > end || end >= metadata.size_bytes {
            return Err(StorageError::RangeNotSatisfiable {
                name: name.to_string(),
                size: metadata.size_bytes,
            });
        }
        file.seek(SeekFrom::Start(start)).await?;
        let length = end - start + 1;
        Ok(ObjectBody {
            metadata,
            length,
            reader: Box::pin(file.take(length)),
        })
    }

    async fn open_full(&self, name: &str) -> Result<ObjectBody, StorageError> {
        let (file, metadata) = self.open_file(name).await?;
        let length = metadata.size_bytes;
        Ok(ObjectBody {
            metadata,
            length,
            reader: Box::pin(file.take(length)),
        })
    }

    async fn put(&self, name: &str, data: Bytes, _content_type: &str) -> Result<String, StorageError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write under a hidden temp name, then rename over the target.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
        let write = async {
            let mut file = File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::Io(e));
        }

        let meta = tokio::fs::metadata(&path).await?;
        Ok(object_metadata(name, &meta).etag)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        validate_prefix(prefix).map_err(|reason| StorageError::InvalidName {
            name: prefix.to_string(),
            reason,
        })?;

        // Only walk the deepest directory the prefix pins down.
        let (base_dir, base_name) = match prefix.rsplit_once('/') {
            Some((dir, _)) => (self.resolve(dir)?, format!("{}/", dir)),
            None => (self.root.clone(), String::new()),
        };
        let files = match collect_files(&base_dir).await {
            Ok(files) => files,
            Err(StorageError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        let mut objects = Vec::new();
        for (relative, path) in files {
            let name = format!("{}{}", base_name, relative);
            if !name.starts_with(prefix) {
                continue;
            }
            match tokio::fs::metadata(&path).await {
                Ok(meta) => objects.push(object_metadata(&name, &meta)),
                // Removed between the walk and the stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let objects = self.list(prefix).await?;
        let mut deleted = 0u64;
        for object in &objects {
            let path = self.resolve(&object.name)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        // A directory prefix goes away entirely, hidden leftovers included.
        if let Some(dir) = prefix.strip_suffix('/') {
            if !dir.is_empty() {
                match tokio::fs::remove_dir_all(self.resolve(dir)?).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::Io(e)),
                }
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        for (name, data) in files {
            store
                .put(name, Bytes::copy_from_slice(data.as_bytes()), "application/octet-stream")
                .await
                .unwrap();
        }
        (dir, store)
    }

    async fn read_all(body: ObjectBody) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut reader = body.reader;
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_stat_reports_size_type_and_etag() {
        let (_dir, store) = store_with(&[("clip.mp4", &"x".repeat(1000))]).await;
        let meta = store.stat("clip.mp4").await.unwrap();
        assert_eq!(meta.size_bytes, 1000);
        assert_eq!(meta.content_type, "video/mp4");
        assert!(meta.etag.starts_with("\"3e8-"));
        assert!(meta.etag.ends_with('"'));
    }

    #[tokio::test]
    async fn test_open_range_yields_exact_bytes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (_dir, store) = store_with(&[]).await;
        store
            .put("clip.mp4", Bytes::from(data.clone()), "video/mp4")
            .await
            .unwrap();

        let body = store.open_range("clip.mp4", 100, 199).await.unwrap();
        assert_eq!(body.length, 100);
        assert_eq!(body.metadata.size_bytes, 1000);
        assert_eq!(read_all(body).await, data[100..200].to_vec());
    }

    #[tokio::test]
    async fn test_open_range_past_end_rejected() {
        let (_dir, store) = store_with(&[("clip.mp4", "0123456789")]).await;
        let err = store.open_range("clip.mp4", 5, 10).await.unwrap_err();
        assert!(matches!(err, StorageError::RangeNotSatisfiable { size: 10, .. }));
    }

    #[tokio::test]
    async fn test_open_full() {
        let (_dir, store) = store_with(&[("a/b.ts", "segment")]).await;
        let body = store.open_full("a/b.ts").await.unwrap();
        assert_eq!(body.length, 7);
        assert_eq!(read_all(body).await, b"segment".to_vec());
    }

    #[tokio::test]
    async fn test_missing_and_directory_are_not_found() {
        let (_dir, store) = store_with(&[("a/b.ts", "x")]).await;
        assert!(store.stat("missing.mp4").await.unwrap_err().is_not_found());
        assert!(store.stat("a").await.unwrap_err().is_not_found());
        assert!(store.open_full("a/b.ts/c").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_io() {
        let (_dir, store) = store_with(&[]).await;
        for name in ["../etc/passwd", "/etc/passwd", "a/../../x", "a\\..\\x"] {
            let err = store.stat(name).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidName { .. }), "{name}");
        }
        assert!(matches!(
            store.put("../escape", Bytes::from_static(b"x"), "text/plain").await,
            Err(StorageError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_by_prefix_skips_hidden() {
        let (dir, store) = store_with(&[
            ("show/master.m3u8", "m"),
            ("show/720p/segment_000.ts", "s0"),
            ("show2/master.m3u8", "m"),
            ("movie.mp4", "v"),
        ])
        .await;
        tokio::fs::write(dir.path().join("show/.tmp"), b"x").await.unwrap();

        let names: Vec<String> = store
            .list("show/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["show/720p/segment_000.ts", "show/master.m3u8"]);

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 4);

        let partial: Vec<String> = store
            .list("show")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(partial.len(), 3);

        assert!(store.list("nothing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_tree() {
        let (dir, store) = store_with(&[
            ("show/master.m3u8", "m"),
            ("show/720p/playlist.m3u8", "p"),
            ("show/720p/segment_000.ts", "s"),
            ("other/master.m3u8", "m"),
        ])
        .await;
        let deleted = store.delete_prefix("show/").await.unwrap();
        assert_eq!(deleted, 3);
        assert!(!dir.path().join("show").exists());
        assert!(store.stat("other/master.m3u8").await.is_ok());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (_dir, store) = store_with(&[("a.mp4", "first")]).await;
        store
            .put("a.mp4", Bytes::from_static(b"second!"), "video/mp4")
            .await
            .unwrap();
        assert_eq!(store.stat("a.mp4").await.unwrap().size_bytes, 7);
        assert_eq!(store.list("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_dir_renames_into_place() {
        let (dir, store) = store_with(&[]).await;
        let staging = dir.path().join(".staging-show");
        tokio::fs::create_dir_all(staging.join("720p")).await.unwrap();
        tokio::fs::write(staging.join("master.m3u8"), b"#EXTM3U\n").await.unwrap();
        tokio::fs::write(staging.join("720p/segment_000.ts"), b"ts").await.unwrap();

        let count = store.publish_dir(&staging, "show").await.unwrap();
        assert_eq!(count, 2);
        assert!(!staging.exists());
        assert!(store.stat("show/master.m3u8").await.is_ok());

        let again = dir.path().join(".staging-again");
        tokio::fs::create_dir_all(&again).await.unwrap();
        assert!(matches!(
            store.publish_dir(&again, "show").await,
            Err(StorageError::AlreadyExists { .. })
        ));
    }
}
