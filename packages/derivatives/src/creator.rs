//! Runs resolved definitions against the primary file.

use common::{StorageError, StorageRegistry};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::definition::{DerivativeDefinition, SourceFile, TransformContext};
use crate::error::{DerivativeError, Result, TransformError};
use crate::model::{Asset, StoredFile};
use crate::persistence::Candidate;
use crate::source::release_sources;

/// Open the primary file for reading. Stores without a local path are copied
/// to a temporary file, returned alongside so it lives as long as the reader.
async fn open_primary(
    storage: &StorageRegistry,
    file: &StoredFile,
) -> Result<(SourceFile, Option<NamedTempFile>)> {
    let store = storage.get(&file.blob.storage)?;
    if let Some(path) = store.local_path(&file.blob.id) {
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(file.blob.id.clone()).into());
        }
        return Ok((SourceFile::open(path)?, None));
    }

    let download = NamedTempFile::new()?;
    let mut reader = storage.open(&file.blob).await?;
    let mut out = tokio::fs::File::create(download.path()).await?;
    let size = tokio::io::copy(&mut reader, &mut out).await?;
    out.flush().await?;
    debug!(blob = %file.blob, size, "Downloaded primary file");

    let source = SourceFile::open(download.path())?;
    Ok((source, Some(download)))
}

/// Open the primary file once and run each definition in order, rewinding
/// between transforms. Definitions that produce nothing are skipped.
///
/// Transforms block, so each runs on the blocking pool.
#[instrument(skip_all, fields(asset_id = %asset.id()))]
pub(crate) async fn run_transforms(
    storage: &StorageRegistry,
    asset: &Asset,
    definitions: Vec<DerivativeDefinition>,
) -> Result<Vec<Candidate>> {
    let Some(file) = asset.file() else {
        return Ok(Vec::new());
    };

    let (mut source, download) = open_primary(storage, file).await?;
    let mut candidates = Vec::with_capacity(definitions.len());

    for definition in definitions {
        let key = definition.key().to_string();
        let ctx = TransformContext {
            asset_id: asset.id(),
            key: key.clone(),
            content_type: asset.content_type().map(str::to_string),
            source_metadata: file.metadata.clone(),
        };

        let joined = tokio::task::spawn_blocking(move || {
            let result = source
                .rewind()
                .map_err(TransformError::from)
                .and_then(|()| definition.apply(&mut source, &ctx));
            (source, definition, result)
        })
        .await;

        let (returned, definition, result) = match joined {
            Ok(parts) => parts,
            Err(e) => {
                release_sources(candidates.into_iter().map(|c: Candidate| c.output), true).await;
                return Err(DerivativeError::Transform {
                    key,
                    source: TransformError::Aborted(e.to_string()),
                });
            }
        };
        source = returned;

        match result {
            Ok(Some(output)) => {
                debug!(key, "Transform produced output");
                candidates.push(Candidate {
                    key,
                    storage: definition.storage_key().map(str::to_string),
                    output,
                });
            }
            Ok(None) => debug!(key, "Transform produced nothing"),
            Err(err) => {
                release_sources(candidates.into_iter().map(|c| c.output), true).await;
                return Err(DerivativeError::Transform { key, source: err });
            }
        }
    }

    drop(download);
    Ok(candidates)
}
