use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::RetryPolicy;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::upsert::{DerivativeRows, UpsertOutcome, upsert_derivative};
use super::{
    AssetDestroyed, AssetGuard, AssetRepository, CommitOutcome, DerivativeChange,
    PrimaryFileReplaced, RepoError,
};
use crate::model::{AssetRecord, Derivative, StoredFile};

/// Table contents of a [`MemoryRepository`].
///
/// Derivative rows are keyed by (asset_id, key), which is the uniqueness
/// constraint: a second insert for the same pair fails.
#[derive(Clone, Debug, Default)]
pub struct MemoryTables {
    assets: HashMap<Uuid, AssetRecord>,
    derivatives: BTreeMap<(Uuid, String), Derivative>,
}

impl MemoryTables {
    pub fn asset(&self, id: Uuid) -> Option<&AssetRecord> {
        self.assets.get(&id)
    }

    pub fn derivatives_for(&self, asset_id: Uuid) -> Vec<Derivative> {
        self.derivatives
            .range((asset_id, String::new())..)
            .take_while(|((id, _), _)| *id == asset_id)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Count of rows for (asset_id, key). Never more than one.
    pub fn row_count(&self, asset_id: Uuid, key: &str) -> usize {
        usize::from(self.derivatives.contains_key(&(asset_id, key.to_string())))
    }

    pub fn total_derivatives(&self) -> usize {
        self.derivatives.len()
    }

    pub fn insert_row(
        &mut self,
        asset_id: Uuid,
        key: &str,
        file: StoredFile,
    ) -> Result<Derivative, RepoError> {
        let row_key = (asset_id, key.to_string());
        if self.derivatives.contains_key(&row_key) {
            return Err(RepoError::UniqueViolation {
                asset_id,
                key: key.to_string(),
            });
        }
        let now = Utc::now();
        let derivative = Derivative {
            id: Uuid::now_v7(),
            asset_id,
            key: key.to_string(),
            file,
            created_at: now,
            updated_at: now,
        };
        self.derivatives.insert(row_key, derivative.clone());
        Ok(derivative)
    }

    pub fn remove_row(&mut self, asset_id: Uuid, key: &str) -> Option<Derivative> {
        self.derivatives.remove(&(asset_id, key.to_string()))
    }

    /// Swap the primary file, drop all derivative rows, and bump the version.
    pub fn replace_primary_file(
        &mut self,
        asset_id: Uuid,
        file: Option<StoredFile>,
    ) -> Option<PrimaryFileReplaced> {
        let record = self.assets.get_mut(&asset_id)?;
        let previous = std::mem::replace(&mut record.file, file);
        record.lock_version += 1;
        record.updated_at = Utc::now();
        let record = record.clone();
        let removed = self.remove_rows_for(asset_id);
        Some(PrimaryFileReplaced {
            record,
            previous,
            removed,
        })
    }

    pub fn remove_asset(&mut self, asset_id: Uuid) -> Option<AssetDestroyed> {
        let record = self.assets.remove(&asset_id)?;
        let derivatives = self.remove_rows_for(asset_id);
        Some(AssetDestroyed {
            record,
            derivatives,
        })
    }

    /// Simulate a writer that committed without touching derivatives.
    pub fn bump_version(&mut self, asset_id: Uuid) -> Option<i64> {
        let record = self.assets.get_mut(&asset_id)?;
        record.lock_version += 1;
        record.updated_at = Utc::now();
        Some(record.lock_version)
    }

    fn remove_rows_for(&mut self, asset_id: Uuid) -> Vec<Derivative> {
        let keys: Vec<_> = self
            .derivatives
            .keys()
            .filter(|(id, _)| *id == asset_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.derivatives.remove(&k))
            .collect()
    }
}

/// Summary handed to commit observers after a successful derivative commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRecord {
    pub asset_id: Uuid,
    pub lock_version: i64,
    pub upserted: Vec<String>,
    pub deleted: Vec<String>,
}

type CommitHook = Box<dyn FnOnce(&mut MemoryTables) + Send>;
type CommitObserver = Arc<dyn Fn(&CommitRecord) + Send + Sync>;

#[derive(Default)]
struct Faults {
    before_commit: VecDeque<CommitHook>,
    failed_commits: VecDeque<String>,
    /// Each entry fails one insert; `Some` first leaves the winning row behind.
    unique_violations: VecDeque<Option<StoredFile>>,
}

#[derive(Default)]
struct Inner {
    tables: MemoryTables,
    faults: Faults,
    observers: Vec<CommitObserver>,
}

/// In-process [`AssetRepository`] with the same guarantees as a relational
/// backend: atomic commits, optimistic version checks, and a uniqueness
/// constraint on (asset_id, key).
///
/// Faults can be queued to reproduce races deterministically.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the tables under the repository lock.
    pub async fn with_tables<T>(&self, f: impl FnOnce(&mut MemoryTables) -> T) -> T {
        let mut inner = self.inner.lock().await;
        f(&mut inner.tables)
    }

    /// Mutate the tables at the start of the next derivative commit, after
    /// the caller has read its guard but before the guard is checked.
    pub async fn before_next_commit(&self, hook: impl FnOnce(&mut MemoryTables) + Send + 'static) {
        self.inner
            .lock()
            .await
            .faults
            .before_commit
            .push_back(Box::new(hook));
    }

    /// Make the next derivative commit fail with a backend error.
    pub async fn fail_next_commit(&self, message: impl Into<String>) {
        self.inner
            .lock()
            .await
            .faults
            .failed_commits
            .push_back(message.into());
    }

    /// Make the next derivative insert fail with a uniqueness violation.
    ///
    /// With `winner`, a row pointing at that file is left in place, as if a
    /// concurrent writer had inserted it first.
    pub async fn inject_unique_violation(&self, winner: Option<StoredFile>) {
        self.inner
            .lock()
            .await
            .faults
            .unique_violations
            .push_back(winner);
    }

    pub async fn on_commit(&self, observer: impl Fn(&CommitRecord) + Send + Sync + 'static) {
        self.inner.lock().await.observers.push(Arc::new(observer));
    }
}

struct MemoryRows<'a> {
    tables: &'a mut MemoryTables,
    unique_violations: &'a mut VecDeque<Option<StoredFile>>,
}

#[async_trait]
impl DerivativeRows for MemoryRows<'_> {
    async fn find_derivative(
        &mut self,
        asset_id: Uuid,
        key: &str,
    ) -> Result<Option<Derivative>, RepoError> {
        Ok(self.tables.derivatives.get(&(asset_id, key.to_string())).cloned())
    }

    async fn insert_derivative(
        &mut self,
        asset_id: Uuid,
        key: &str,
        file: &StoredFile,
    ) -> Result<Derivative, RepoError> {
        if let Some(winner) = self.unique_violations.pop_front() {
            if let Some(winner) = winner {
                self.tables.insert_row(asset_id, key, winner)?;
            }
            return Err(RepoError::UniqueViolation {
                asset_id,
                key: key.to_string(),
            });
        }
        self.tables.insert_row(asset_id, key, file.clone())
    }

    async fn update_derivative_file(
        &mut self,
        id: Uuid,
        file: &StoredFile,
    ) -> Result<Option<Derivative>, RepoError> {
        Ok(self
            .tables
            .derivatives
            .values_mut()
            .find(|d| d.id == id)
            .map(|d| {
                d.file = file.clone();
                d.updated_at = Utc::now();
                d.clone()
            }))
    }
}

#[async_trait]
impl AssetRepository for MemoryRepository {
    async fn insert_asset(
        &self,
        id: Uuid,
        file: Option<StoredFile>,
    ) -> Result<AssetRecord, RepoError> {
        let mut inner = self.inner.lock().await;
        if inner.tables.assets.contains_key(&id) {
            return Err(RepoError::DuplicateAsset(id));
        }
        let record = AssetRecord {
            id,
            file,
            lock_version: 0,
            updated_at: Utc::now(),
        };
        inner.tables.assets.insert(id, record.clone());
        Ok(record)
    }

    async fn find_asset(&self, id: Uuid) -> Result<Option<AssetRecord>, RepoError> {
        Ok(self.inner.lock().await.tables.assets.get(&id).cloned())
    }

    async fn list_derivatives(&self, asset_id: Uuid) -> Result<Vec<Derivative>, RepoError> {
        Ok(self.inner.lock().await.tables.derivatives_for(asset_id))
    }

    async fn commit_derivatives(
        &self,
        guard: &AssetGuard,
        changes: &[DerivativeChange],
        unique_retry: &RetryPolicy,
    ) -> Result<CommitOutcome, RepoError> {
        let mut locked = self.inner.lock().await;
        let inner = &mut *locked;

        if let Some(hook) = inner.faults.before_commit.pop_front() {
            hook(&mut inner.tables);
        }
        if let Some(message) = inner.faults.failed_commits.pop_front() {
            return Err(RepoError::Backend(message));
        }

        let current = inner.tables.assets.get(&guard.asset_id);
        if !current.is_some_and(|record| guard.matches(record)) {
            debug!(asset_id = %guard.asset_id, "Commit guard did not match");
            return Ok(CommitOutcome::Conflict);
        }

        // Work on a copy so a failed change leaves the tables untouched.
        let mut staged = inner.tables.clone();
        let mut rows = MemoryRows {
            tables: &mut staged,
            unique_violations: &mut inner.faults.unique_violations,
        };
        let mut superseded = Vec::new();
        for change in changes {
            match change {
                DerivativeChange::Upsert { key, file } => {
                    let outcome =
                        upsert_derivative(&mut rows, guard.asset_id, key, file, unique_retry)
                            .await?;
                    if let UpsertOutcome::Updated { previous, .. } = &outcome {
                        superseded.push(previous.clone());
                    }
                    if let UpsertOutcome::Exhausted { attempts } = outcome {
                        return Err(RepoError::UniqueViolationExhausted {
                            asset_id: guard.asset_id,
                            key: key.clone(),
                            attempts,
                        });
                    }
                }
                DerivativeChange::Delete { key } => {
                    rows.tables.remove_row(guard.asset_id, key);
                }
            }
        }

        let lock_version = staged
            .bump_version(guard.asset_id)
            .ok_or_else(|| RepoError::Corrupt(format!("asset {} vanished", guard.asset_id)))?;
        let derivatives = staged.derivatives_for(guard.asset_id);
        inner.tables = staged;

        let record = CommitRecord {
            asset_id: guard.asset_id,
            lock_version,
            upserted: keys_of(changes, true),
            deleted: keys_of(changes, false),
        };
        for observer in &inner.observers {
            observer(&record);
        }

        Ok(CommitOutcome::Committed {
            lock_version,
            derivatives,
            superseded,
        })
    }

    async fn replace_primary_file(
        &self,
        asset_id: Uuid,
        file: Option<StoredFile>,
    ) -> Result<Option<PrimaryFileReplaced>, RepoError> {
        Ok(self
            .inner
            .lock()
            .await
            .tables
            .replace_primary_file(asset_id, file))
    }

    async fn destroy_asset(&self, asset_id: Uuid) -> Result<Option<AssetDestroyed>, RepoError> {
        Ok(self.inner.lock().await.tables.remove_asset(asset_id))
    }
}

fn keys_of(changes: &[DerivativeChange], upserts: bool) -> Vec<String> {
    changes
        .iter()
        .filter(|c| matches!(c, DerivativeChange::Upsert { .. }) == upserts)
        .map(|c| c.key().to_string())
        .collect()
}
