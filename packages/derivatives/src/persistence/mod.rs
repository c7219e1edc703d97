//! Merges derivative changes into the durable asset state.
//!
//! Every write reloads the asset, plans its delta against what is actually
//! stored and commits under an [`AssetGuard`]. Blobs are uploaded before the
//! commit and superseded blobs are deleted only after it, so a key always has
//! at least one stored copy. Losing a race to a primary-file change is not an
//! error: callers get a `Stale` outcome.

mod add;
mod remove;

use std::sync::Arc;

use common::{Fingerprint, StorageRegistry};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::error::{DerivativeError, PreconditionError, Result};
use crate::model::{Asset, Derivative, MetadataOverride, StoredFile};
use crate::repository::{AssetGuard, AssetRepository, CommitOutcome, DerivativeChange};
use crate::source::DerivativeOutput;

pub use add::AddOutcome;
pub use remove::RemoveOutcome;

/// One derivative waiting to be uploaded and committed.
#[derive(Debug)]
pub(crate) struct Candidate {
    pub key: String,
    /// Storage key chosen by the producing definition, if any.
    pub storage: Option<String>,
    pub output: DerivativeOutput,
}

#[derive(Clone, Debug)]
pub struct AddOptions {
    /// Store every blob of this call under this storage key.
    pub storage: Option<String>,
    /// Metadata applied on top of detected values for every derivative.
    pub metadata: MetadataOverride,
    /// Persist even if the in-memory asset carries unrelated unsaved edits.
    pub allow_other_changes: bool,
    /// Remove caller-owned source files once uploaded. Default: true.
    pub delete_sources: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            storage: None,
            metadata: MetadataOverride::default(),
            allow_other_changes: false,
            delete_sources: true,
        }
    }
}

impl AddOptions {
    pub fn storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    pub fn metadata(mut self, metadata: MetadataOverride) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn allow_other_changes(mut self, allow: bool) -> Self {
        self.allow_other_changes = allow;
        self
    }

    pub fn delete_sources(mut self, delete: bool) -> Self {
        self.delete_sources = delete;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct RemoveOptions {
    pub allow_other_changes: bool,
}

impl RemoveOptions {
    pub fn allow_other_changes(mut self, allow: bool) -> Self {
        self.allow_other_changes = allow;
        self
    }
}

/// How a guarded commit loop ended.
pub(crate) enum Settled {
    Committed {
        before: Vec<Derivative>,
        lock_version: i64,
        after: Vec<Derivative>,
        superseded: Vec<StoredFile>,
    },
    /// The plan had nothing to change.
    Unchanged {
        lock_version: i64,
        derivatives: Vec<Derivative>,
    },
    /// The asset vanished or its primary file changed.
    Stale,
}

/// Persistence operations over one repository and set of blob stores.
#[derive(Clone)]
pub(crate) struct Persistence {
    repo: Arc<dyn AssetRepository>,
    storage: StorageRegistry,
    config: PersistenceConfig,
    default_storage: String,
}

impl Persistence {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        storage: StorageRegistry,
        config: PersistenceConfig,
        default_storage: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            storage,
            config,
            default_storage: default_storage.into(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn AssetRepository> {
        &self.repo
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    /// Reload, plan and commit until the commit lands, the asset goes stale,
    /// or the conflict budget runs out.
    ///
    /// `plan` sees the freshly loaded derivative rows on every attempt.
    pub(crate) async fn commit_guarded<F>(
        &self,
        asset_id: Uuid,
        expected: Option<Fingerprint>,
        mut plan: F,
    ) -> Result<Settled>
    where
        F: FnMut(&[Derivative]) -> Vec<DerivativeChange> + Send,
    {
        let policy = self.config.commit_retry();
        let unique_retry = self.config.unique_retry();

        for attempt in 1..=policy.attempts() {
            let Some(record) = self.repo.find_asset(asset_id).await? else {
                info!(%asset_id, "Asset vanished before commit");
                return Ok(Settled::Stale);
            };
            if record.fingerprint() != expected {
                info!(%asset_id, "Primary file changed before commit");
                return Ok(Settled::Stale);
            }

            let before = self.repo.list_derivatives(asset_id).await?;
            let changes = plan(&before);
            if changes.is_empty() {
                return Ok(Settled::Unchanged {
                    lock_version: record.lock_version,
                    derivatives: before,
                });
            }

            let guard = AssetGuard::for_record(&record);
            match self
                .repo
                .commit_derivatives(&guard, &changes, &unique_retry)
                .await?
            {
                CommitOutcome::Committed {
                    lock_version,
                    derivatives,
                    superseded,
                } => {
                    return Ok(Settled::Committed {
                        before,
                        lock_version,
                        after: derivatives,
                        superseded,
                    });
                }
                CommitOutcome::Conflict if attempt < policy.attempts() => {
                    let delay = policy.backoff(attempt);
                    warn!(%asset_id, attempt, ?delay, "Derivative commit conflicted, retrying");
                    tokio::time::sleep(delay).await;
                }
                CommitOutcome::Conflict => {}
            }
        }

        warn!(%asset_id, attempts = policy.attempts(), "Giving up on conflicting commits");
        Err(DerivativeError::CommitConflict {
            asset_id,
            attempts: policy.attempts(),
        })
    }
}

pub(crate) fn check_unsaved(
    asset: &Asset,
    allow_other_changes: bool,
) -> std::result::Result<(), PreconditionError> {
    if allow_other_changes || !asset.has_unsaved_changes() {
        return Ok(());
    }
    Err(PreconditionError::UnsavedChanges {
        asset_id: asset.id(),
        fields: asset.pending_changes().collect::<Vec<_>>().join(", "),
    })
}
