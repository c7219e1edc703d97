//! Durable storage of assets and their derivative rows.
//!
//! The repository is the relational half of persistence. It owns the
//! (asset_id, key) uniqueness constraint and the optimistic version check
//! that every derivative commit is conditioned on.

mod memory;
mod upsert;

#[cfg(feature = "sea-orm")]
mod relational;

use async_trait::async_trait;
use common::{Fingerprint, RetryPolicy};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{AssetRecord, Derivative, StoredFile};

pub use memory::{CommitRecord, MemoryRepository, MemoryTables};
#[cfg(feature = "sea-orm")]
pub use relational::SeaOrmRepository;
pub use upsert::{DerivativeRows, UpsertOutcome, upsert_derivative};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("derivative {key:?} already exists for asset {asset_id}")]
    UniqueViolation { asset_id: Uuid, key: String },

    #[error("derivative {key:?} for asset {asset_id} still conflicted after {attempts} attempts")]
    UniqueViolationExhausted {
        asset_id: Uuid,
        key: String,
        attempts: u32,
    },

    #[error("asset {0} already exists")]
    DuplicateAsset(Uuid),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Backend(String),
}

/// The durable state a commit expects to find.
///
/// Folded into the write's WHERE condition: the commit applies only if the
/// asset row still exists with this exact version and fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetGuard {
    pub asset_id: Uuid,
    pub lock_version: i64,
    pub fingerprint: Option<Fingerprint>,
}

impl AssetGuard {
    pub fn for_record(record: &AssetRecord) -> Self {
        Self {
            asset_id: record.id,
            lock_version: record.lock_version,
            fingerprint: record.fingerprint(),
        }
    }

    pub fn matches(&self, record: &AssetRecord) -> bool {
        record.id == self.asset_id
            && record.lock_version == self.lock_version
            && record.fingerprint() == self.fingerprint
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DerivativeChange {
    Upsert { key: String, file: StoredFile },
    Delete { key: String },
}

impl DerivativeChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Upsert { key, .. } | Self::Delete { key } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommitOutcome {
    /// Changes are durable. Carries the new version and the full derivative set.
    Committed {
        lock_version: i64,
        derivatives: Vec<Derivative>,
        /// Files that upserted rows pointed at before this commit, including
        /// rows inserted by a concurrent writer after our read.
        superseded: Vec<StoredFile>,
    },
    /// The guard no longer matched; nothing was written.
    Conflict,
}

/// Result of swapping an asset's primary file.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryFileReplaced {
    pub record: AssetRecord,
    pub previous: Option<StoredFile>,
    /// Derivative rows deleted with the old file. Their blobs are still in storage.
    pub removed: Vec<Derivative>,
}

/// Result of destroying an asset.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetDestroyed {
    pub record: AssetRecord,
    pub derivatives: Vec<Derivative>,
}

#[async_trait]
pub trait AssetRepository: Send + Sync {
    /// Insert a new asset row at version 0.
    async fn insert_asset(
        &self,
        id: Uuid,
        file: Option<StoredFile>,
    ) -> Result<AssetRecord, RepoError>;

    async fn find_asset(&self, id: Uuid) -> Result<Option<AssetRecord>, RepoError>;

    /// Every derivative row for the asset, ordered by key.
    async fn list_derivatives(&self, asset_id: Uuid) -> Result<Vec<Derivative>, RepoError>;

    /// Atomically apply `changes` if `guard` still matches the durable row.
    ///
    /// Bumps the asset's version on success. Upserts resolve uniqueness
    /// violations through [`upsert_derivative`] bounded by `unique_retry`.
    async fn commit_derivatives(
        &self,
        guard: &AssetGuard,
        changes: &[DerivativeChange],
        unique_retry: &RetryPolicy,
    ) -> Result<CommitOutcome, RepoError>;

    /// Swap the primary file and delete every derivative row in one commit.
    ///
    /// Returns `None` if the asset no longer exists.
    async fn replace_primary_file(
        &self,
        asset_id: Uuid,
        file: Option<StoredFile>,
    ) -> Result<Option<PrimaryFileReplaced>, RepoError>;

    /// Delete the asset row and its derivative rows in one commit.
    async fn destroy_asset(&self, asset_id: Uuid) -> Result<Option<AssetDestroyed>, RepoError>;
}
