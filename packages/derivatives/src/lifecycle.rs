//! When derivative work happens around primary-file changes.
//!
//! Directives are plain values passed by the caller. They decide whether and
//! when the hooks run, never how persistence works.

use std::collections::BTreeMap;

use common::{BlobRef, StorageRegistry};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{DerivativeError, Result};
use crate::fingerprint::has_changed_since;
use crate::model::{Asset, AssetRecord, Derivative, MetadataOverride, StoredFile};
use crate::resolver::ResolveOptions;
use crate::service::DerivativeService;
use crate::source::{DerivativeOutput, discard_blobs, release_sources, upload_output};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingDirective {
    /// Run before the triggering call returns.
    #[default]
    Inline,
    /// Run on a spawned task.
    Background,
    /// Do not run.
    Disabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleDirectives {
    pub create_derivatives: TimingDirective,
    pub delete: TimingDirective,
}

impl LifecycleDirectives {
    pub fn create_derivatives(mut self, timing: TimingDirective) -> Self {
        self.create_derivatives = timing;
        self
    }

    pub fn delete(mut self, timing: TimingDirective) -> Self {
        self.delete = timing;
        self
    }
}

/// Work done according to a [`TimingDirective`].
///
/// Inline work has already finished and carries its own result, so a failed
/// hook does not hide the outcome of the call that triggered it.
#[derive(Debug)]
pub enum Scheduled<T> {
    Inline(Result<T>),
    Background(JoinHandle<Result<T>>),
    Disabled,
}

impl<T> Scheduled<T> {
    /// Wait for the work if it was spawned. `None` when disabled.
    pub async fn finish(self) -> Result<Option<T>> {
        match self {
            Self::Inline(result) => result.map(Some),
            Self::Background(handle) => match handle.await {
                Ok(result) => result.map(Some),
                Err(e) => Err(DerivativeError::TaskFailed(e.to_string())),
            },
            Self::Disabled => Ok(None),
        }
    }
}

/// Result of promoting a new primary file.
#[derive(Debug)]
pub struct Promotion {
    pub file: StoredFile,
    /// Deletion of the superseded primary blob and the old derivative blobs.
    pub cleanup: Scheduled<usize>,
    pub derivatives: Scheduled<BTreeMap<String, StoredFile>>,
}

/// Result of destroying an asset.
#[derive(Debug)]
pub struct Destruction {
    pub record: AssetRecord,
    pub derivatives: Vec<Derivative>,
    pub cleanup: Scheduled<usize>,
}

async fn delete_all(storage: &StorageRegistry, blobs: &[BlobRef]) -> usize {
    let mut deleted = 0;
    for blob in blobs {
        match storage.delete(blob).await {
            Ok(true) => deleted += 1,
            Ok(false) => {}
            Err(e) => warn!(%blob, error = %e, "Failed to delete blob"),
        }
    }
    deleted
}

async fn schedule_delete(
    storage: &StorageRegistry,
    blobs: Vec<BlobRef>,
    timing: TimingDirective,
) -> Scheduled<usize> {
    match timing {
        TimingDirective::Inline => Scheduled::Inline(Ok(delete_all(storage, &blobs).await)),
        TimingDirective::Background => {
            let storage = storage.clone();
            Scheduled::Background(tokio::spawn(async move {
                Ok(delete_all(&storage, &blobs).await)
            }))
        }
        TimingDirective::Disabled => {
            info!(count = blobs.len(), "Blob deletion disabled, leaving blobs in place");
            Scheduled::Disabled
        }
    }
}

impl DerivativeService {
    /// Replace the asset's primary file.
    ///
    /// The new file is uploaded to the store and fingerprinted, then swapped
    /// in with one commit that also drops every derivative row. The old blobs
    /// are deleted afterwards per `directives.delete`, and derivatives are
    /// regenerated per `directives.create_derivatives`. Once the swap commits
    /// this returns `Ok`; a failed inline regeneration is reported inside
    /// `Promotion::derivatives`.
    #[instrument(skip_all, fields(asset_id = %asset.id()))]
    pub async fn promote_primary_file(
        &self,
        asset: &mut Asset,
        upload: impl Into<DerivativeOutput>,
        directives: LifecycleDirectives,
    ) -> Result<Promotion> {
        let output = upload.into();
        let store_key = self.config().storage.store_key.clone();
        let file = upload_output(
            self.storage(),
            &store_key,
            asset.id(),
            "primary",
            &output,
            &MetadataOverride::default(),
        )
        .await;
        release_sources([output], false).await;
        let file = file?;

        let replaced = match self
            .repository()
            .replace_primary_file(asset.id(), Some(file.clone()))
            .await
        {
            Ok(Some(replaced)) => replaced,
            Ok(None) => {
                discard_blobs(self.storage(), &[&file.blob]).await;
                return Err(DerivativeError::AssetNotFound(asset.id()));
            }
            Err(e) => {
                discard_blobs(self.storage(), &[&file.blob]).await;
                return Err(e.into());
            }
        };
        info!(
            blob = %file.blob,
            removed = replaced.removed.len(),
            "Promoted primary file"
        );

        let stale_blobs: Vec<BlobRef> = replaced
            .previous
            .iter()
            .map(|f| f.blob.clone())
            .chain(replaced.removed.iter().map(|d| d.file.blob.clone()))
            .collect();
        let expected = replaced.record.fingerprint();
        let asset_id = replaced.record.id;
        asset.refresh_from(replaced.record, Vec::new());

        let cleanup = schedule_delete(self.storage(), stale_blobs, directives.delete).await;

        let derivatives = match directives.create_derivatives {
            TimingDirective::Inline => {
                let created = self
                    .create_derivatives(asset, ResolveOptions::default())
                    .await;
                if let Err(e) = &created {
                    warn!(error = %e, "Derivative creation failed after promotion");
                }
                Scheduled::Inline(created)
            }
            TimingDirective::Background => {
                let service = self.clone();
                Scheduled::Background(tokio::spawn(async move {
                    if has_changed_since(service.repository().as_ref(), asset_id, expected.as_ref())
                        .await?
                    {
                        info!(%asset_id, "Primary file changed again, skipping derivatives");
                        return Ok(BTreeMap::new());
                    }
                    let mut asset = service.load_asset(asset_id).await?;
                    service
                        .create_derivatives(&mut asset, ResolveOptions::default())
                        .await
                }))
            }
            TimingDirective::Disabled => Scheduled::Disabled,
        };

        Ok(Promotion {
            file,
            cleanup,
            derivatives,
        })
    }

    /// Delete the asset and its derivative rows, then their blobs per
    /// `directives.delete`. `None` if the asset was already gone.
    #[instrument(skip_all, fields(asset_id = %asset.id()))]
    pub async fn destroy_asset(
        &self,
        asset: Asset,
        directives: LifecycleDirectives,
    ) -> Result<Option<Destruction>> {
        let Some(destroyed) = self.repository().destroy_asset(asset.id()).await? else {
            info!("Asset already destroyed");
            return Ok(None);
        };

        let blobs: Vec<BlobRef> = destroyed
            .record
            .file
            .iter()
            .map(|f| f.blob.clone())
            .chain(destroyed.derivatives.iter().map(|d| d.file.blob.clone()))
            .collect();
        info!(derivatives = destroyed.derivatives.len(), "Destroyed asset");
        let cleanup = schedule_delete(self.storage(), blobs, directives.delete).await;

        Ok(Some(Destruction {
            record: destroyed.record,
            derivatives: destroyed.derivatives,
            cleanup,
        }))
    }
}
