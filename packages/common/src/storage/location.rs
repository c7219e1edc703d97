use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::StorageError;

/// Reference to a blob held by a named store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobRef {
    /// Storage key the blob lives in (e.g. "store", "derivatives").
    pub storage: String,
    /// Generated id within that storage.
    pub id: String,
}

impl BlobRef {
    pub fn new(storage: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            storage: storage.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.storage, self.id)
    }
}

/// Generate a fresh blob id under `prefix`.
///
/// The result looks like `asset-id/thumb/3f2a…e1.jpg`. Ids never derive from
/// content, so identical bytes stored twice yield two independent blobs.
pub fn generate_id(prefix: &str, extension: Option<&str>) -> String {
    let name = Uuid::new_v4().simple().to_string();
    let prefix = prefix.trim_matches('/');
    let ext = extension
        .map(|e| e.trim_start_matches('.'))
        .filter(|e| !e.is_empty());

    match (prefix.is_empty(), ext) {
        (true, None) => name,
        (true, Some(ext)) => format!("{name}.{ext}"),
        (false, None) => format!("{prefix}/{name}"),
        (false, Some(ext)) => format!("{prefix}/{name}.{ext}"),
    }
}

/// Reject ids that are empty, absolute, or climb out of the store root.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id.contains('\\') {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    let path = Path::new(id);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}
