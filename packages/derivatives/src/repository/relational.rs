use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::RetryPolicy;
use sea_orm::sea_query::{Expr, Index, LockType, PostgresQueryBuilder};
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Schema, Set, SqlErr, TransactionTrait,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::upsert::{DerivativeRows, UpsertOutcome, upsert_derivative};
use super::{
    AssetDestroyed, AssetGuard, AssetRepository, CommitOutcome, DerivativeChange,
    PrimaryFileReplaced, RepoError,
};
use crate::entity::{asset, derivative};
use crate::model::{AssetRecord, Derivative, StoredFile};

impl From<DbErr> for RepoError {
    fn from(err: DbErr) -> Self {
        RepoError::Backend(err.to_string())
    }
}

/// [`AssetRepository`] backed by PostgreSQL through SeaORM.
#[derive(Clone)]
pub struct SeaOrmRepository {
    db: DatabaseConnection,
}

impl SeaOrmRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect with pooled options and make sure the tables and indexes exist.
    pub async fn connect(db_url: &str) -> Result<Self, DbErr> {
        let mut opt = ConnectOptions::new(db_url.to_owned());
        opt.max_connections(20)
            .min_connections(2)
            .connect_timeout(Duration::from_secs(8))
            .acquire_timeout(Duration::from_secs(8))
            .sqlx_logging(false);

        let db = Database::connect(opt).await?;
        ensure_schema(&db).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Create the asset and derivative tables plus the (asset_id, key) unique index.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let schema = Schema::new(DbBackend::Postgres);

    let mut stmt = schema.create_table_from_entity(asset::Entity);
    stmt.if_not_exists();
    db.execute_unprepared(&stmt.to_string(PostgresQueryBuilder))
        .await?;

    let mut stmt = schema.create_table_from_entity(derivative::Entity);
    stmt.if_not_exists();
    db.execute_unprepared(&stmt.to_string(PostgresQueryBuilder))
        .await?;

    let stmt = Index::create()
        .if_not_exists()
        .unique()
        .name("idx_derivative_asset_key")
        .table(derivative::Entity)
        .col(derivative::Column::AssetId)
        .col(derivative::Column::Key)
        .to_string(PostgresQueryBuilder);
    db.execute_unprepared(&stmt).await?;
    info!("Ensured derivative schema exists");

    Ok(())
}

fn encode_file(file: &StoredFile) -> Result<serde_json::Value, RepoError> {
    serde_json::to_value(file).map_err(|e| RepoError::Corrupt(e.to_string()))
}

fn decode_file(value: serde_json::Value) -> Result<StoredFile, RepoError> {
    serde_json::from_value(value).map_err(|e| RepoError::Corrupt(e.to_string()))
}

fn asset_record(model: asset::Model) -> Result<AssetRecord, RepoError> {
    Ok(AssetRecord {
        id: model.id,
        file: model.file_data.map(decode_file).transpose()?,
        lock_version: model.lock_version,
        updated_at: model.updated_at,
    })
}

fn derivative_row(model: derivative::Model) -> Result<Derivative, RepoError> {
    Ok(Derivative {
        id: model.id,
        asset_id: model.asset_id,
        key: model.key,
        file: decode_file(model.file_data)?,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn sha512_of(file: Option<&StoredFile>) -> Option<String> {
    file.and_then(|f| f.metadata.sha512).map(|fp| fp.to_hex())
}

async fn derivatives_of<C: ConnectionTrait>(
    conn: &C,
    asset_id: Uuid,
) -> Result<Vec<Derivative>, RepoError> {
    derivative::Entity::find()
        .filter(derivative::Column::AssetId.eq(asset_id))
        .order_by_asc(derivative::Column::Key)
        .all(conn)
        .await?
        .into_iter()
        .map(derivative_row)
        .collect()
}

/// Derivative rows seen through an open transaction.
struct TxnRows<'a> {
    txn: &'a DatabaseTransaction,
}

#[async_trait]
impl DerivativeRows for TxnRows<'_> {
    async fn find_derivative(
        &mut self,
        asset_id: Uuid,
        key: &str,
    ) -> Result<Option<Derivative>, RepoError> {
        derivative::Entity::find()
            .filter(derivative::Column::AssetId.eq(asset_id))
            .filter(derivative::Column::Key.eq(key))
            .one(self.txn)
            .await?
            .map(derivative_row)
            .transpose()
    }

    async fn insert_derivative(
        &mut self,
        asset_id: Uuid,
        key: &str,
        file: &StoredFile,
    ) -> Result<Derivative, RepoError> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let row = derivative::ActiveModel {
            id: Set(id),
            asset_id: Set(asset_id),
            key: Set(key.to_string()),
            file_data: Set(encode_file(file)?),
            created_at: Set(now),
            updated_at: Set(now),
        };

        // A failed statement poisons the enclosing transaction; the savepoint
        // lets the caller retry after a uniqueness violation.
        let savepoint = self.txn.begin().await?;
        match derivative::Entity::insert(row)
            .exec_without_returning(&savepoint)
            .await
        {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(Derivative {
                    id,
                    asset_id,
                    key: key.to_string(),
                    file: file.clone(),
                    created_at: now,
                    updated_at: now,
                })
            }
            Err(err) => {
                savepoint.rollback().await?;
                match err.sql_err() {
                    Some(SqlErr::UniqueConstraintViolation(_)) => Err(RepoError::UniqueViolation {
                        asset_id,
                        key: key.to_string(),
                    }),
                    _ => Err(err.into()),
                }
            }
        }
    }

    async fn update_derivative_file(
        &mut self,
        id: Uuid,
        file: &StoredFile,
    ) -> Result<Option<Derivative>, RepoError> {
        let result = derivative::Entity::update_many()
            .col_expr(derivative::Column::FileData, Expr::value(encode_file(file)?))
            .col_expr(derivative::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(derivative::Column::Id.eq(id))
            .exec(self.txn)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }

        derivative::Entity::find_by_id(id)
            .one(self.txn)
            .await?
            .map(derivative_row)
            .transpose()
    }
}

#[async_trait]
impl AssetRepository for SeaOrmRepository {
    async fn insert_asset(
        &self,
        id: Uuid,
        file: Option<StoredFile>,
    ) -> Result<AssetRecord, RepoError> {
        let now = Utc::now();
        let row = asset::ActiveModel {
            id: Set(id),
            file_data: Set(file.as_ref().map(encode_file).transpose()?),
            sha512: Set(sha512_of(file.as_ref())),
            lock_version: Set(0),
            updated_at: Set(now),
        };
        asset::Entity::insert(row)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => RepoError::DuplicateAsset(id),
                _ => err.into(),
            })?;

        Ok(AssetRecord {
            id,
            file,
            lock_version: 0,
            updated_at: now,
        })
    }

    async fn find_asset(&self, id: Uuid) -> Result<Option<AssetRecord>, RepoError> {
        asset::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(asset_record)
            .transpose()
    }

    async fn list_derivatives(&self, asset_id: Uuid) -> Result<Vec<Derivative>, RepoError> {
        derivatives_of(&self.db, asset_id).await
    }

    async fn commit_derivatives(
        &self,
        guard: &AssetGuard,
        changes: &[DerivativeChange],
        unique_retry: &RetryPolicy,
    ) -> Result<CommitOutcome, RepoError> {
        let txn = self.db.begin().await?;
        let lock_version = guard.lock_version + 1;

        let bump = asset::Entity::update_many()
            .col_expr(asset::Column::LockVersion, Expr::value(lock_version))
            .col_expr(asset::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(asset::Column::Id.eq(guard.asset_id))
            .filter(asset::Column::LockVersion.eq(guard.lock_version));
        let bump = match &guard.fingerprint {
            Some(fp) => bump.filter(asset::Column::Sha512.eq(fp.to_hex())),
            None => bump.filter(asset::Column::Sha512.is_null()),
        };

        if bump.exec(&txn).await?.rows_affected == 0 {
            txn.rollback().await?;
            debug!(asset_id = %guard.asset_id, "Commit guard did not match");
            return Ok(CommitOutcome::Conflict);
        }

        let mut rows = TxnRows { txn: &txn };
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
                        txn.rollback().await?;
                        return Err(RepoError::UniqueViolationExhausted {
                            asset_id: guard.asset_id,
                            key: key.clone(),
                            attempts,
                        });
                    }
                }
                DerivativeChange::Delete { key } => {
                    derivative::Entity::delete_many()
                        .filter(derivative::Column::AssetId.eq(guard.asset_id))
                        .filter(derivative::Column::Key.eq(key.as_str()))
                        .exec(&txn)
                        .await?;
                }
            }
        }

        let derivatives = derivatives_of(&txn, guard.asset_id).await?;
        txn.commit().await?;

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
        let txn = self.db.begin().await?;

        let Some(current) = asset::Entity::find_by_id(asset_id)
            .lock(LockType::Update)
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(None);
        };
        let previous = asset_record(current)?;

        let now = Utc::now();
        let lock_version = previous.lock_version + 1;
        asset::Entity::update_many()
            .col_expr(
                asset::Column::FileData,
                Expr::value(file.as_ref().map(encode_file).transpose()?),
            )
            .col_expr(asset::Column::Sha512, Expr::value(sha512_of(file.as_ref())))
            .col_expr(asset::Column::LockVersion, Expr::value(lock_version))
            .col_expr(asset::Column::UpdatedAt, Expr::value(now))
            .filter(asset::Column::Id.eq(asset_id))
            .exec(&txn)
            .await?;

        let removed = derivatives_of(&txn, asset_id).await?;
        derivative::Entity::delete_many()
            .filter(derivative::Column::AssetId.eq(asset_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        Ok(Some(PrimaryFileReplaced {
            record: AssetRecord {
                id: asset_id,
                file,
                lock_version,
                updated_at: now,
            },
            previous: previous.file,
            removed,
        }))
    }

    async fn destroy_asset(&self, asset_id: Uuid) -> Result<Option<AssetDestroyed>, RepoError> {
        let txn = self.db.begin().await?;

        let Some(current) = asset::Entity::find_by_id(asset_id)
            .lock(LockType::Update)
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(None);
        };
        let record = asset_record(current)?;

        let derivatives = derivatives_of(&txn, asset_id).await?;
        derivative::Entity::delete_many()
            .filter(derivative::Column::AssetId.eq(asset_id))
            .exec(&txn)
            .await?;
        asset::Entity::delete_by_id(asset_id).exec(&txn).await?;

        txn.commit().await?;

        Ok(Some(AssetDestroyed {
            record,
            derivatives,
        }))
    }
}
