use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::{BlobRef, Fingerprint};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata recorded alongside a stored file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Strong digest of the bytes. Always present on promoted primary files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Format-specific fields (duration, bitrate, page count, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Caller-supplied metadata that wins over detected values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataOverride {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub extra: Map<String, Value>,
}

impl MetadataOverride {
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn extra(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merged_with(&self, other: &MetadataOverride) -> MetadataOverride {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        MetadataOverride {
            filename: other.filename.clone().or_else(|| self.filename.clone()),
            mime_type: other.mime_type.clone().or_else(|| self.mime_type.clone()),
            width: other.width.or(self.width),
            height: other.height.or(self.height),
            extra,
        }
    }

    pub(crate) fn apply(&self, metadata: &mut FileMetadata) {
        if let Some(filename) = &self.filename {
            metadata.filename = Some(filename.clone());
        }
        if let Some(mime_type) = &self.mime_type {
            metadata.mime_type = Some(mime_type.clone());
        }
        if self.width.is_some() {
            metadata.width = self.width;
        }
        if self.height.is_some() {
            metadata.height = self.height;
        }
        metadata.extra.extend(self.extra.clone());
    }
}

/// A blob plus the metadata describing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub blob: BlobRef,
    pub metadata: FileMetadata,
}

impl StoredFile {
    pub fn content_type(&self) -> Option<&str> {
        self.metadata.mime_type.as_deref()
    }
}

/// One generated artifact for an (asset, key) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Derivative {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub key: String,
    pub file: StoredFile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The durable row for an asset, as last read from the repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: Uuid,
    pub file: Option<StoredFile>,
    /// Bumped on every committed change to the asset or its derivatives.
    pub lock_version: i64,
    pub updated_at: DateTime<Utc>,
}

impl AssetRecord {
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.file.as_ref().and_then(|f| f.metadata.sha512)
    }
}

/// In-memory view of an asset and its derivatives.
///
/// The view can go stale: persistence always re-reads the durable row before
/// writing and refreshes this view afterwards.
#[derive(Clone, Debug)]
pub struct Asset {
    id: Uuid,
    file: Option<StoredFile>,
    lock_version: i64,
    derivatives: Vec<Derivative>,
    pending_changes: BTreeSet<String>,
}

impl Asset {
    pub fn from_record(record: AssetRecord, mut derivatives: Vec<Derivative>) -> Self {
        derivatives.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            id: record.id,
            file: record.file,
            lock_version: record.lock_version,
            derivatives,
            pending_changes: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn file(&self) -> Option<&StoredFile> {
        self.file.as_ref()
    }

    pub fn lock_version(&self) -> i64 {
        self.lock_version
    }

    pub fn content_type(&self) -> Option<&str> {
        self.file.as_ref().and_then(StoredFile::content_type)
    }

    /// Fingerprint of the primary file as recorded in metadata.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.file.as_ref().and_then(|f| f.metadata.sha512)
    }

    pub fn derivatives(&self) -> &[Derivative] {
        &self.derivatives
    }

    pub fn derivative_for(&self, key: &str) -> Option<&Derivative> {
        self.derivatives.iter().find(|d| d.key == key)
    }

    pub fn derivative_keys(&self) -> BTreeSet<String> {
        self.derivatives.iter().map(|d| d.key.clone()).collect()
    }

    /// Record an in-memory edit that has not been saved.
    pub fn mark_changed(&mut self, field: impl Into<String>) {
        self.pending_changes.insert(field.into());
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.pending_changes.is_empty()
    }

    pub fn pending_changes(&self) -> impl Iterator<Item = &str> {
        self.pending_changes.iter().map(String::as_str)
    }

    pub(crate) fn refresh_derivatives(&mut self, lock_version: i64, mut derivatives: Vec<Derivative>) {
        derivatives.sort_by(|a, b| a.key.cmp(&b.key));
        self.lock_version = lock_version;
        self.derivatives = derivatives;
    }

    pub(crate) fn refresh_from(&mut self, record: AssetRecord, derivatives: Vec<Derivative>) {
        self.file = record.file;
        self.refresh_derivatives(record.lock_version, derivatives);
        self.pending_changes.remove("file");
    }
}
