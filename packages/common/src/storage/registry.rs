use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::error::StorageError;
use super::filesystem::FilesystemBlobStore;
use super::location::{BlobRef, generate_id};
use super::traits::{BlobStore, BoxReader};
use crate::config::StorageConfig;

/// Named blob stores, looked up by storage key.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    stores: HashMap<String, Arc<dyn BlobStore>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` under `key`, replacing any previous registration.
    pub fn with_store(mut self, key: impl Into<String>, store: Arc<dyn BlobStore>) -> Self {
        self.stores.insert(key.into(), store);
        self
    }

    /// Build filesystem stores for the configured keys under `config.root`.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut registry = Self::new();
        for key in [
            &config.store_key,
            &config.derivative_storage_key,
            &config.cache_key,
        ] {
            let store =
                FilesystemBlobStore::new(config.root.join(key), config.max_blob_size).await?;
            registry = registry.with_store(key.clone(), Arc::new(store));
        }
        Ok(registry)
    }

    pub fn get(&self, key: &str) -> Result<&Arc<dyn BlobStore>, StorageError> {
        self.stores
            .get(key)
            .ok_or_else(|| StorageError::UnknownStorage(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.stores.contains_key(key)
    }

    /// Upload bytes to a freshly generated id under `prefix` in `storage`.
    pub async fn upload(
        &self,
        storage: &str,
        prefix: &str,
        extension: Option<&str>,
        data: &[u8],
    ) -> Result<(BlobRef, u64), StorageError> {
        let store = self.get(storage)?;
        let id = generate_id(prefix, extension);
        let size = store.put(&id, data).await?;
        debug!(storage, %id, size, "Uploaded blob");
        Ok((BlobRef::new(storage, id), size))
    }

    /// Stream a reader to a freshly generated id under `prefix` in `storage`.
    pub async fn upload_stream(
        &self,
        storage: &str,
        prefix: &str,
        extension: Option<&str>,
        reader: BoxReader,
    ) -> Result<(BlobRef, u64), StorageError> {
        let store = self.get(storage)?;
        let id = generate_id(prefix, extension);
        let size = store.put_stream(&id, reader).await?;
        debug!(storage, %id, size, "Uploaded blob");
        Ok((BlobRef::new(storage, id), size))
    }

    pub async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, StorageError> {
        self.get(&blob.storage)?.get(&blob.id).await
    }

    pub async fn open(&self, blob: &BlobRef) -> Result<BoxReader, StorageError> {
        self.get(&blob.storage)?.get_stream(&blob.id).await
    }

    pub async fn exists(&self, blob: &BlobRef) -> Result<bool, StorageError> {
        self.get(&blob.storage)?.exists(&blob.id).await
    }

    /// Delete a blob. Deleting a blob that does not exist is a no-op.
    pub async fn delete(&self, blob: &BlobRef) -> Result<bool, StorageError> {
        let deleted = self.get(&blob.storage)?.delete(&blob.id).await?;
        debug!(%blob, deleted, "Deleted blob");
        Ok(deleted)
    }
}
