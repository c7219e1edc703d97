#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use common::storage::{BoxReader, MemoryBlobStore};
use common::{BlobStore, StorageError, StorageRegistry};
use uuid::Uuid;

use derivatives::{
    Asset, DefinitionRegistry, Derivative, DerivativeDefinition, DerivativeOutput,
    DerivativeService, DerivativesAppConfig, LifecycleDirectives, MemoryRepository,
    MetadataOverride, TimingDirective,
};

/// Ordered log of storage and commit events shared by a test environment.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// Position of the first event equal to `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.snapshot().iter().position(|e| e == event)
    }
}

/// Memory store that logs puts and deletes and can fail uploads on demand.
pub struct RecordingStore {
    inner: MemoryBlobStore,
    events: EventLog,
    failing_puts: AtomicU32,
}

impl RecordingStore {
    pub fn new(events: EventLog) -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            events,
            failing_puts: AtomicU32::new(0),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.ids().iter().any(|i| i == id)
    }

    /// Fail the next `n` uploads.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> usize {
        self.events
            .snapshot()
            .iter()
            .filter(|e| e.starts_with("put:"))
            .count()
    }
}

#[async_trait]
impl BlobStore for RecordingStore {
    async fn put_stream(&self, id: &str, reader: BoxReader) -> Result<u64, StorageError> {
        let should_fail = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StorageError::Io(std::io::Error::other("injected upload failure")));
        }
        let size = self.inner.put_stream(id, reader).await?;
        self.events.push(format!("put:{id}"));
        Ok(size)
    }

    async fn get_stream(&self, id: &str) -> Result<BoxReader, StorageError> {
        self.inner.get_stream(id).await
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.exists(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let deleted = self.inner.delete(id).await?;
        self.events.push(format!("delete:{id}"));
        Ok(deleted)
    }

    async fn size(&self, id: &str) -> Result<u64, StorageError> {
        self.inner.size(id).await
    }
}

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub struct TestEnv {
    pub service: DerivativeService,
    pub repo: Arc<MemoryRepository>,
    pub store: Arc<RecordingStore>,
    pub derivatives: Arc<RecordingStore>,
    pub events: EventLog,
}

impl TestEnv {
    pub async fn new(definitions: DefinitionRegistry) -> Self {
        Self::with_config(definitions, test_config()).await
    }

    pub async fn with_config(definitions: DefinitionRegistry, config: DerivativesAppConfig) -> Self {
        init_tracing();
        let events = EventLog::default();
        let repo = Arc::new(MemoryRepository::new());
        let store = Arc::new(RecordingStore::new(events.clone()));
        let derivatives = Arc::new(RecordingStore::new(events.clone()));

        let storage = StorageRegistry::new()
            .with_store(config.storage.store_key.clone(), store.clone())
            .with_store(config.storage.derivative_storage_key.clone(), derivatives.clone());

        let commit_events = events.clone();
        repo.on_commit(move |commit| {
            commit_events.push(format!("commit:{}", commit.lock_version));
        })
        .await;

        let service = DerivativeService::new(repo.clone(), storage, definitions, config);
        Self {
            service,
            repo,
            store,
            derivatives,
            events,
        }
    }

    /// A persisted asset whose primary file is `content`, with no derivatives.
    pub async fn asset_with(&self, content: &[u8], filename: &str) -> Asset {
        let mut asset = self.service.create_asset().await.unwrap();
        let upload = DerivativeOutput::bytes(content)
            .with_metadata(MetadataOverride::default().filename(filename));
        let directives =
            LifecycleDirectives::default().create_derivatives(TimingDirective::Disabled);
        self.service
            .promote_primary_file(&mut asset, upload, directives)
            .await
            .unwrap();
        self.events.clear();
        asset
    }

    pub async fn rows(&self, asset_id: Uuid) -> Vec<Derivative> {
        self.repo
            .with_tables(|tables| tables.derivatives_for(asset_id))
            .await
    }

    pub async fn row_count(&self, asset_id: Uuid, key: &str) -> usize {
        self.repo
            .with_tables(|tables| tables.row_count(asset_id, key))
            .await
    }

    /// Derivative storage holds exactly the blobs referenced by `asset_ids`' rows.
    pub async fn assert_no_orphans(&self, asset_ids: &[Uuid]) {
        let mut referenced = BTreeSet::new();
        for id in asset_ids {
            for row in self.rows(*id).await {
                referenced.insert(row.file.blob.id);
            }
        }
        let stored: BTreeSet<String> = self.derivatives.ids().into_iter().collect();
        assert_eq!(stored, referenced, "derivative storage does not match persisted rows");
    }
}

pub fn test_config() -> DerivativesAppConfig {
    let mut config = DerivativesAppConfig::default();
    config.persistence.conflict_base_delay_ms = 0;
    config
}

/// Definition emitting `<tag>:<primary bytes>` as a PNG-named file.
pub fn tagged(key: &str, tag: &'static str) -> DerivativeDefinition {
    DerivativeDefinition::new(key, move |file, _| {
        let mut out = tag.as_bytes().to_vec();
        out.push(b':');
        out.extend(file.read_all()?);
        Ok(Some(DerivativeOutput::new(derivatives::DerivativeSource::Bytes {
            data: out,
            filename: Some(format!("{tag}.png")),
        })))
    })
}

pub fn registry(definitions: Vec<DerivativeDefinition>) -> DefinitionRegistry {
    definitions
        .into_iter()
        .fold(DefinitionRegistry::builder(), |builder, def| builder.define(def))
        .build()
}
