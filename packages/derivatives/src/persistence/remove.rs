use std::collections::BTreeSet;

use common::BlobRef;
use tracing::{debug, info, instrument};

use super::{Persistence, RemoveOptions, Settled, check_unsaved};
use crate::error::Result;
use crate::model::{Asset, Derivative};
use crate::repository::DerivativeChange;
use crate::source::discard_blobs;

/// Result of removing derivatives.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoveOutcome {
    /// Rows removed by this call. Keys that were already gone are absent.
    Removed(Vec<Derivative>),
    /// The asset vanished or its primary file changed. Nothing was done.
    Stale,
}

impl RemoveOutcome {
    pub fn removed(&self) -> &[Derivative] {
        match self {
            Self::Removed(removed) => removed,
            Self::Stale => &[],
        }
    }
}

impl Persistence {
    /// Drop the named keys from the asset's current derivatives, then delete
    /// their blobs. Keys that do not exist are ignored.
    #[instrument(skip_all, fields(asset_id = %asset.id(), ?keys))]
    pub(crate) async fn remove(
        &self,
        asset: &mut Asset,
        keys: &[String],
        options: &RemoveOptions,
    ) -> Result<RemoveOutcome> {
        check_unsaved(asset, options.allow_other_changes)?;
        let wanted: BTreeSet<&str> = keys.iter().map(String::as_str).collect();

        let settled = self
            .commit_guarded(asset.id(), asset.fingerprint(), |current| {
                current
                    .iter()
                    .filter(|d| wanted.contains(d.key.as_str()))
                    .map(|d| DerivativeChange::Delete { key: d.key.clone() })
                    .collect()
            })
            .await?;

        match settled {
            Settled::Committed {
                before,
                lock_version,
                after,
                ..
            } => {
                let remaining: BTreeSet<&str> = after.iter().map(|d| d.key.as_str()).collect();
                let removed: Vec<Derivative> = before
                    .into_iter()
                    .filter(|d| wanted.contains(d.key.as_str()) && !remaining.contains(d.key.as_str()))
                    .collect();
                let blobs: Vec<&BlobRef> = removed.iter().map(|d| &d.file.blob).collect();
                discard_blobs(&self.storage, &blobs).await;

                info!(lock_version, removed = removed.len(), "Removed derivatives");
                asset.refresh_derivatives(lock_version, after);
                Ok(RemoveOutcome::Removed(removed))
            }
            Settled::Unchanged {
                lock_version,
                derivatives,
            } => {
                debug!("Nothing to remove");
                asset.refresh_derivatives(lock_version, derivatives);
                Ok(RemoveOutcome::Removed(Vec::new()))
            }
            Settled::Stale => Ok(RemoveOutcome::Stale),
        }
    }
}
