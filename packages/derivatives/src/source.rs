//! Byte sources handed to persistence, and how they reach blob storage.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use common::{BlobRef, Fingerprint, StorageRegistry};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{FileMetadata, MetadataOverride, StoredFile};

/// Where the bytes of a derivative come from.
#[derive(Debug)]
pub enum DerivativeSource {
    /// In-memory content, with an optional original filename.
    Bytes {
        data: Vec<u8>,
        filename: Option<String>,
    },
    /// A file owned by the caller. Removed after processing only when the
    /// caller asks for sources to be deleted.
    Path(PathBuf),
    /// A temporary file. Removed when dropped, whatever the outcome.
    TempFile(NamedTempFile),
}

impl DerivativeSource {
    pub fn filename(&self) -> Option<String> {
        match self {
            Self::Bytes { filename, .. } => filename.clone(),
            Self::Path(path) => file_name(path),
            Self::TempFile(file) => file_name(file.path()),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Bytes { .. } => None,
            Self::Path(path) => Some(path),
            Self::TempFile(file) => Some(file.path()),
        }
    }

    async fn reader(&self) -> io::Result<common::storage::BoxReader> {
        Ok(match self {
            Self::Bytes { data, .. } => Box::new(Cursor::new(data.clone())),
            Self::Path(path) => Box::new(tokio::fs::File::open(path).await?),
            Self::TempFile(file) => Box::new(tokio::fs::File::open(file.path()).await?),
        })
    }

    /// Read the whole source into memory.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Bytes { data, .. } => Ok(data),
            Self::Path(path) => std::fs::read(path),
            Self::TempFile(file) => std::fs::read(file.path()),
        }
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

impl From<Vec<u8>> for DerivativeSource {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes {
            data,
            filename: None,
        }
    }
}

impl From<&[u8]> for DerivativeSource {
    fn from(data: &[u8]) -> Self {
        data.to_vec().into()
    }
}

impl From<PathBuf> for DerivativeSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<NamedTempFile> for DerivativeSource {
    fn from(file: NamedTempFile) -> Self {
        Self::TempFile(file)
    }
}

/// A transform result or caller-supplied derivative, with metadata that
/// overrides whatever is detected at upload.
#[derive(Debug)]
pub struct DerivativeOutput {
    pub source: DerivativeSource,
    pub metadata: MetadataOverride,
}

impl DerivativeOutput {
    pub fn new(source: impl Into<DerivativeSource>) -> Self {
        Self {
            source: source.into(),
            metadata: MetadataOverride::default(),
        }
    }

    pub fn bytes(data: impl AsRef<[u8]>) -> Self {
        Self::new(data.as_ref())
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into())
    }

    pub fn temp_file(file: NamedTempFile) -> Self {
        Self::new(file)
    }

    pub fn with_metadata(mut self, metadata: MetadataOverride) -> Self {
        self.metadata = self.metadata.merged_with(&metadata);
        self
    }

    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        self.source.into_bytes()
    }
}

impl From<DerivativeSource> for DerivativeOutput {
    fn from(source: DerivativeSource) -> Self {
        Self::new(source)
    }
}

impl From<Vec<u8>> for DerivativeOutput {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<PathBuf> for DerivativeOutput {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

/// Content type and blob extension for an output: explicit override first,
/// then a guess from the filename.
fn detect_type(filename: Option<&str>, mime_override: Option<&str>) -> (Option<String>, Option<String>) {
    let from_name = filename.and_then(|name| mime_guess::from_path(name).first());
    let mime = mime_override
        .map(str::to_string)
        .or_else(|| from_name.as_ref().map(|m| m.essence_str().to_string()));

    let name_ext = filename
        .and_then(|name| Path::new(name).extension())
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    let extension = match (&mime, name_ext) {
        (_, Some(ext)) if mime_override.is_none() => Some(ext),
        (Some(mime), name_ext) => mime_guess::get_mime_extensions_str(mime)
            .and_then(|exts| exts.first())
            .map(|e| e.to_string())
            .or(name_ext),
        (None, name_ext) => name_ext,
    };
    (mime, extension)
}

/// Upload one output to `storage_key` under `<asset_id>/<key>/`.
pub(crate) async fn upload_output(
    storage: &StorageRegistry,
    storage_key: &str,
    asset_id: Uuid,
    key: &str,
    output: &DerivativeOutput,
    call_metadata: &MetadataOverride,
) -> Result<StoredFile> {
    let metadata_override = output.metadata.merged_with(call_metadata);
    let filename = metadata_override
        .filename
        .clone()
        .or_else(|| output.source.filename());
    let (mime_type, extension) =
        detect_type(filename.as_deref(), metadata_override.mime_type.as_deref());

    let mut reader = output.source.reader().await?;
    let (sha512, _) = Fingerprint::compute_reader(&mut reader).await?;

    let prefix = format!("{asset_id}/{key}");
    let reader = output.source.reader().await?;
    let (blob, size) = storage
        .upload_stream(storage_key, &prefix, extension.as_deref(), reader)
        .await?;

    let mut metadata = FileMetadata {
        filename,
        size,
        mime_type,
        sha512: Some(sha512),
        ..FileMetadata::default()
    };
    metadata_override.apply(&mut metadata);

    debug!(%asset_id, key, %blob, size, "Uploaded derivative");
    Ok(StoredFile { blob, metadata })
}

/// Best-effort removal of blobs uploaded by a call that did not commit them.
pub(crate) async fn discard_blobs(storage: &StorageRegistry, blobs: &[&BlobRef]) {
    for &blob in blobs {
        if let Err(e) = storage.delete(blob).await {
            warn!(%blob, error = %e, "Failed to delete blob");
        }
    }
}

/// Release consumed sources. Temporary files always go; caller-owned paths
/// only when `delete_sources` is set.
pub(crate) async fn release_sources<I>(outputs: I, delete_sources: bool)
where
    I: IntoIterator<Item = DerivativeOutput>,
{
    for output in outputs {
        if let DerivativeSource::Path(path) = output.source
            && delete_sources
            && let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to delete source file");
        }
    }
}
