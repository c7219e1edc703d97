use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::error::StorageError;
use super::location::validate_id;
use super::traits::{BlobStore, BoxReader};

/// In-process blob store backed by a sorted map.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    max_size: Option<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            blobs: RwLock::default(),
            max_size: Some(max_size),
        }
    }

    /// Ids of every blob currently held, in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_stream(&self, id: &str, mut reader: BoxReader) -> Result<u64, StorageError> {
        validate_id(id)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let actual = data.len() as u64;
        if let Some(limit) = self.max_size
            && actual > limit
        {
            return Err(StorageError::SizeLimitExceeded { actual, limit });
        }

        self.write().insert(id.to_string(), data);
        Ok(actual)
    }

    async fn get_stream(&self, id: &str) -> Result<BoxReader, StorageError> {
        let data = self
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.read().contains_key(id))
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.write().remove(id).is_some())
    }

    async fn size(&self, id: &str) -> Result<u64, StorageError> {
        self.read()
            .get(id)
            .map(|d| d.len() as u64)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}
