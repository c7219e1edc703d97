use std::collections::{BTreeMap, BTreeSet};

use common::BlobRef;
use tracing::{info, instrument, warn};

use super::{AddOptions, Candidate, Persistence, Settled, check_unsaved};
use crate::error::Result;
use crate::fingerprint::require_fingerprint;
use crate::model::{Asset, StoredFile};
use crate::repository::DerivativeChange;
use crate::source::{discard_blobs, release_sources, upload_output};

/// Result of adding derivatives.
#[derive(Clone, Debug, PartialEq)]
pub enum AddOutcome {
    /// Committed; the stored file for each added key.
    Persisted(BTreeMap<String, StoredFile>),
    /// The primary file changed or the asset vanished first. Nothing was
    /// committed and the uploaded blobs were removed.
    Stale,
}

impl AddOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }

    /// Stored files by key; empty when stale.
    pub fn into_files(self) -> BTreeMap<String, StoredFile> {
        match self {
            Self::Persisted(files) => files,
            Self::Stale => BTreeMap::new(),
        }
    }
}

impl Persistence {
    /// Upload candidates and merge them into the asset's current derivatives.
    ///
    /// Candidates win over existing rows with the same key. The blobs they
    /// replace are deleted after the commit.
    #[instrument(skip_all, fields(asset_id = %asset.id(), count = candidates.len()))]
    pub(crate) async fn add(
        &self,
        asset: &mut Asset,
        candidates: Vec<Candidate>,
        options: &AddOptions,
    ) -> Result<AddOutcome> {
        let checked = check_unsaved(asset, options.allow_other_changes)
            .and_then(|()| require_fingerprint(asset));
        let fingerprint = match checked {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                release_sources(candidates.into_iter().map(|c| c.output), options.delete_sources)
                    .await;
                return Err(e.into());
            }
        };
        if candidates.is_empty() {
            return Ok(AddOutcome::Persisted(BTreeMap::new()));
        }

        let mut uploaded: Vec<(String, StoredFile)> = Vec::with_capacity(candidates.len());
        let mut failure = None;
        for candidate in &candidates {
            let storage_key = options
                .storage
                .as_deref()
                .or(candidate.storage.as_deref())
                .unwrap_or(&self.default_storage);
            match upload_output(
                &self.storage,
                storage_key,
                asset.id(),
                &candidate.key,
                &candidate.output,
                &options.metadata,
            )
            .await
            {
                Ok(file) => uploaded.push((candidate.key.clone(), file)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        release_sources(candidates.into_iter().map(|c| c.output), options.delete_sources).await;

        if let Some(e) = failure {
            warn!(error = %e, "Upload failed, discarding uploaded derivatives");
            discard_blobs(&self.storage, &blobs_of(&uploaded)).await;
            return Err(e);
        }

        let changes: Vec<DerivativeChange> = uploaded
            .iter()
            .map(|(key, file)| DerivativeChange::Upsert {
                key: key.clone(),
                file: file.clone(),
            })
            .collect();

        let settled = self
            .commit_guarded(asset.id(), Some(fingerprint), |_| changes.clone())
            .await;

        match settled {
            Ok(Settled::Committed {
                before,
                lock_version,
                after,
                superseded,
            }) => {
                let kept: BTreeSet<&BlobRef> = after.iter().map(|d| &d.file.blob).collect();
                let replaced: Vec<&BlobRef> = before
                    .iter()
                    .map(|d| &d.file.blob)
                    .chain(superseded.iter().map(|f| &f.blob))
                    .filter(|blob| !kept.contains(blob))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                discard_blobs(&self.storage, &replaced).await;

                info!(
                    lock_version,
                    added = uploaded.len(),
                    replaced = replaced.len(),
                    "Persisted derivatives"
                );
                asset.refresh_derivatives(lock_version, after);
                Ok(AddOutcome::Persisted(uploaded.into_iter().collect()))
            }
            Ok(Settled::Unchanged {
                lock_version,
                derivatives,
            }) => {
                asset.refresh_derivatives(lock_version, derivatives);
                Ok(AddOutcome::Persisted(uploaded.into_iter().collect()))
            }
            Ok(Settled::Stale) => {
                info!("Asset changed while derivatives were produced, discarding them");
                discard_blobs(&self.storage, &blobs_of(&uploaded)).await;
                Ok(AddOutcome::Stale)
            }
            Err(e) => {
                warn!(error = %e, "Commit failed, discarding uploaded derivatives");
                discard_blobs(&self.storage, &blobs_of(&uploaded)).await;
                Err(e)
            }
        }
    }
}

fn blobs_of(uploaded: &[(String, StoredFile)]) -> Vec<&BlobRef> {
    uploaded.iter().map(|(_, file)| &file.blob).collect()
}
