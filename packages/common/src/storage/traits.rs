use std::io::Cursor;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::StorageError;

/// Type alias for a boxed async reader.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Blob storage addressed by generated, hierarchical ids.
///
/// Ids are opaque to the store apart from `/` separating path segments.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `id`, returning the number of bytes written.
    async fn put(&self, id: &str, data: &[u8]) -> Result<u64, StorageError> {
        let reader: BoxReader = Box::new(Cursor::new(data.to_vec()));
        self.put_stream(id, reader).await
    }

    /// Store data from an async reader under `id`.
    async fn put_stream(&self, id: &str, reader: BoxReader) -> Result<u64, StorageError>;

    /// Retrieve all bytes for a blob.
    async fn get(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.get_stream(id).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Retrieve a blob as a streaming async reader.
    async fn get_stream(&self, id: &str) -> Result<BoxReader, StorageError>;

    /// Check whether a blob exists.
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Delete a blob.
    ///
    /// Returns `true` if the blob was deleted, `false` if it did not exist.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Get the size of a blob in bytes.
    async fn size(&self, id: &str) -> Result<u64, StorageError>;

    /// Path of the blob on the local filesystem, for stores that have one.
    fn local_path(&self, _id: &str) -> Option<PathBuf> {
        None
    }
}
