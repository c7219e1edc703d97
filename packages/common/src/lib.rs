//! Shared storage primitives: blob stores, fingerprints, and retry policy.

pub mod config;
pub mod retry;
pub mod storage;

pub use config::StorageConfig;
pub use retry::{RetryPolicy, calculate_backoff};
pub use storage::{BlobRef, BlobStore, Fingerprint, StorageError, StorageRegistry};
