//! Staleness checks against the primary file's persisted digest.

use common::Fingerprint;
use uuid::Uuid;

use crate::error::PreconditionError;
use crate::model::Asset;
use crate::repository::{AssetRepository, RepoError};

/// The digest recorded in the asset's primary-file metadata, if any.
pub fn current_fingerprint(asset: &Asset) -> Option<Fingerprint> {
    asset.fingerprint()
}

/// Like [`current_fingerprint`], but an asset without a digest cannot have
/// derivatives attached: there would be no way to detect staleness later.
pub fn require_fingerprint(asset: &Asset) -> Result<Fingerprint, PreconditionError> {
    current_fingerprint(asset).ok_or(PreconditionError::MissingFingerprint(asset.id()))
}

/// Whether the durable row's digest differs from `previous`.
///
/// Always re-reads the row; a vanished asset counts as changed.
pub async fn has_changed_since(
    repo: &dyn AssetRepository,
    asset_id: Uuid,
    previous: Option<&Fingerprint>,
) -> Result<bool, RepoError> {
    let current = repo
        .find_asset(asset_id)
        .await?
        .map(|record| record.fingerprint());
    Ok(match current {
        None => true,
        Some(current) => current.as_ref() != previous,
    })
}
