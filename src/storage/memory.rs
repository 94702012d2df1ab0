use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::error::StorageError;

use super::{ContentStore, ObjectBody, ObjectMetadata};

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

/// In-memory storage backend for tests and the `memory` package backend.
///
/// Objects live in a name-ordered map behind a `RwLock`; no lock is held
/// while a caller consumes a body.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    writes: Arc<RwLock<Vec<String>>>,
    generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    last_modified: DateTime<Utc>,
    etag: String,
}

impl StoredObject {
    fn metadata(&self, name: &str) -> ObjectMetadata {
        ObjectMetadata {
            name: name.to_string(),
            size_bytes: self.data.len() as u64,
            content_type: self.content_type.clone(),
            last_modified: self.last_modified,
            etag: self.etag.clone(),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Names in the order they were written.
    pub async fn write_order(&self) -> Vec<String> {
        self.writes.read().await.clone()
    }

    async fn get(&self, name: &str) -> Result<StoredObject, StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidName {
                name: String::new(),
                reason: "name is empty".to_string(),
            });
        }
        self.objects
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                name: name.to_string(),
            })
    }
}

impl ContentStore for InMemoryStore {
    async fn stat(&self, name: &str) -> Result<ObjectMetadata, StorageError> {
        Ok(self.get(name).await?.metadata(name))
    }

    async fn open_range(&self, name: &str, start: u64, end: u64) -> Result<ObjectBody, StorageError> {
        let object = self.get(name).await?;
        let size = object.data.len() as u64;
        if start > end || end >= size {
            return Err(StorageError::RangeNotSatisfiable {
                name: name.to_string(),
                size,
            });
        }
        let slice = object.data.slice(start as usize..=end as usize);
        Ok(ObjectBody {
            metadata: object.metadata(name),
            length: slice.len() as u64,
            reader: Box::pin(Cursor::new(slice)),
        })
    }

    async fn open_full(&self, name: &str) -> Result<ObjectBody, StorageError> {
        let object = self.get(name).await?;
        Ok(ObjectBody {
            metadata: object.metadata(name),
            length: object.data.len() as u64,
            reader: Box::pin(Cursor::new(object.data)),
        })
    }

    async fn put(&self, name: &str, data: Bytes, content_type: &str) -> Result<String, StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidName {
                name: String::new(),
                reason: "name is empty".to_string(),
            });
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let etag = format!("\"{:x}-{:x}\"", data.len(), generation);
        self.objects.write().await.insert(
            name.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
                etag: etag.clone(),
            },
        );
        self.writes.write().await.push(name.to_string());
        Ok(etag)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| object.metadata(name))
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut objects = self.objects.write().await;
        let before = objects.len();
        objects.retain(|name, _| !name.starts_with(prefix));
        Ok((before - objects.len()) as u64)
    }
}
