use std::path::PathBuf;

use serde::Deserialize;

/// Blob storage configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for filesystem stores. Default: "./storage".
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Largest blob accepted by any store, in bytes. Default: 1 GiB.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u64,
    /// Storage key for promoted primary files. Default: "store".
    #[serde(default = "default_store_key")]
    pub store_key: String,
    /// Storage key for derivative blobs. Default: "derivatives".
    #[serde(default = "default_derivative_storage_key")]
    pub derivative_storage_key: String,
    /// Storage key for unpromoted uploads. Default: "cache".
    #[serde(default = "default_cache_key")]
    pub cache_key: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}
fn default_max_blob_size() -> u64 {
    1024 * 1024 * 1024
}
fn default_store_key() -> String {
    "store".into()
}
fn default_derivative_storage_key() -> String {
    "derivatives".into()
}
fn default_cache_key() -> String {
    "cache".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_blob_size: default_max_blob_size(),
            store_key: default_store_key(),
            derivative_storage_key: default_derivative_storage_key(),
            cache_key: default_cache_key(),
        }
    }
}
