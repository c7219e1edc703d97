use common::StorageError;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::RepoError;

/// A derivative operation refused to start.
///
/// These are caller mistakes, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("asset {0} has no persisted sha512 fingerprint; derivatives cannot be attached")]
    MissingFingerprint(Uuid),

    #[error("asset {asset_id} has unsaved changes ({fields}); pass allow_other_changes to persist anyway")]
    UnsavedChanges { asset_id: Uuid, fields: String },
}

/// Failure raised by a derivative transform.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transform task aborted: {0}")]
    Aborted(String),
}

impl TransformError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum DerivativeError {
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("Transform for derivative {key:?} failed: {source}")]
    Transform {
        key: String,
        #[source]
        source: TransformError,
    },

    #[error("Source file error: {0}")]
    Source(#[from] std::io::Error),

    #[error("Gave up persisting derivatives for asset {asset_id} after {attempts} conflicting commits")]
    CommitConflict { asset_id: Uuid, attempts: u32 },

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Asset {0} not found")]
    AssetNotFound(Uuid),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, DerivativeError>;
